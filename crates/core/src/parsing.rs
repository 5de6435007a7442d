use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

pub fn compute_sha256_hex(xml: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(xml.as_bytes());
    let bytes = hasher.finalize();
    hex::encode(bytes)
}

/// Follows `path` by local element names, starting below `node`.
pub fn find_element<'a, 'input: 'a>(
    node: roxmltree::Node<'a, 'input>,
    path: &[&str],
) -> Option<roxmltree::Node<'a, 'input>> {
    if path.is_empty() {
        return Some(node);
    }
    for child in node.children() {
        if child.is_element() && child.tag_name().name() == path[0] {
            if path.len() == 1 {
                return Some(child);
            }
            if let Some(found) = find_element(child, &path[1..]) {
                return Some(found);
            }
        }
    }
    None
}

/// First element anywhere below `node` (inclusive) with the given local name.
pub fn find_descendant<'a, 'input: 'a>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

pub fn child_text(node: roxmltree::Node, name: &str) -> Option<String> {
    find_element(node, &[name])
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_text_at_path(doc: &roxmltree::Document, path: &[&str]) -> Option<String> {
    find_element(doc.root_element(), path)
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Identifying fields read back from an NFe document, signed or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSummary {
    pub access_key: String,
    pub number: Option<u32>,
    pub series: Option<u16>,
    pub environment: Option<u8>,
    pub issuer_cnpj: Option<String>,
    pub total: Option<String>,
    pub signed: bool,
}

pub fn parse_document_summary(xml: &str) -> Result<DocumentSummary> {
    let doc = roxmltree::Document::parse(xml)?;
    let root = doc.root_element();

    let inf = find_descendant(root, "infNFe").ok_or_else(|| anyhow!("missing infNFe element"))?;
    let id = inf
        .attribute("Id")
        .ok_or_else(|| anyhow!("infNFe has no Id attribute"))?;
    let access_key = id.strip_prefix("NFe").unwrap_or(id).to_string();

    let ide = find_element(inf, &["ide"]);
    let number = ide.and_then(|n| child_text(n, "nNF")).and_then(|s| s.parse().ok());
    let series = ide.and_then(|n| child_text(n, "serie")).and_then(|s| s.parse().ok());
    let environment = ide.and_then(|n| child_text(n, "tpAmb")).and_then(|s| s.parse().ok());
    let issuer_cnpj = find_element(inf, &["emit"]).and_then(|n| child_text(n, "CNPJ"));
    let total = find_element(inf, &["total", "ICMSTot"]).and_then(|n| child_text(n, "vNF"));
    let signed = find_descendant(root, "Signature").is_some();

    Ok(DocumentSummary {
        access_key,
        number,
        series,
        environment,
        issuer_cnpj,
        total,
        signed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<NFe xmlns="http://www.portalfiscal.inf.br/nfe">
  <infNFe versao="4.00" Id="NFe35240612345678000195550010000000011123456787">
    <ide><serie>1</serie><nNF>1</nNF><tpAmb>2</tpAmb></ide>
    <emit><CNPJ>12345678000195</CNPJ></emit>
    <total><ICMSTot><vNF>100.00</vNF></ICMSTot></total>
  </infNFe>
</NFe>"#;

    #[test]
    fn summary_reads_identifying_fields() {
        let s = parse_document_summary(DOC).unwrap();
        assert_eq!(s.access_key, "35240612345678000195550010000000011123456787");
        assert_eq!(s.number, Some(1));
        assert_eq!(s.series, Some(1));
        assert_eq!(s.environment, Some(2));
        assert_eq!(s.issuer_cnpj.as_deref(), Some("12345678000195"));
        assert_eq!(s.total.as_deref(), Some("100.00"));
        assert!(!s.signed);
    }

    #[test]
    fn summary_requires_inf_nfe() {
        assert!(parse_document_summary("<NFe/>").is_err());
        assert!(parse_document_summary("not xml").is_err());
    }

    #[test]
    fn sha256_is_lowercase_hex() {
        assert_eq!(
            compute_sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
