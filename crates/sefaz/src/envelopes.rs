//! NFe 4.00 web service messages and SOAP 1.2 framing.

use anyhow::{anyhow, bail, Context, Result};
use nfe_core::document::NFE_NAMESPACE;
use nfe_core::parsing::{child_text, find_descendant, find_element};

use crate::{AuthorityReply, InnerProtocol};

pub const WSDL_BASE: &str = "http://www.portalfiscal.inf.br/nfe/wsdl";

/// One of the four services: WSDL namespace suffix and operation name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Status,
    Authorization,
    Receipt,
    Protocol,
}

impl Service {
    pub fn wsdl(self) -> &'static str {
        match self {
            Service::Status => "NFeStatusServico4",
            Service::Authorization => "NFeAutorizacao4",
            Service::Receipt => "NFeRetAutorizacao4",
            Service::Protocol => "NFeConsultaProtocolo4",
        }
    }

    pub fn operation(self) -> &'static str {
        match self {
            Service::Status => "nfeStatusServicoNF",
            Service::Authorization => "nfeAutorizacaoLote",
            Service::Receipt => "nfeRetAutorizacaoLote",
            Service::Protocol => "nfeConsultaNF",
        }
    }

    pub fn content_type(self) -> String {
        format!(
            "application/soap+xml; charset=utf-8; action=\"{}/{}/{}\"",
            WSDL_BASE,
            self.wsdl(),
            self.operation()
        )
    }
}

pub fn soap_envelope(service: Service, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><soap12:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:soap12="http://www.w3.org/2003/05/soap-envelope"><soap12:Body><nfeDadosMsg xmlns="{}/{}">{}</nfeDadosMsg></soap12:Body></soap12:Envelope>"#,
        WSDL_BASE,
        service.wsdl(),
        body
    )
}

/// Drops a leading `<?xml ...?>` declaration so a document can be embedded.
pub fn strip_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return trimmed[end + 2..].trim_start();
        }
    }
    trimmed
}

pub fn status_request(environment: u8, region_code: u8) -> String {
    format!(
        r#"<consStatServ xmlns="{NFE_NAMESPACE}" versao="4.00"><tpAmb>{environment}</tpAmb><cUF>{region_code:02}</cUF><xServ>STATUS</xServ></consStatServ>"#
    )
}

pub fn batch_request(batch_id: &str, signed_document: &str) -> String {
    format!(
        r#"<enviNFe xmlns="{NFE_NAMESPACE}" versao="4.00"><idLote>{batch_id}</idLote><indSinc>0</indSinc>{}</enviNFe>"#,
        strip_declaration(signed_document)
    )
}

pub fn receipt_request(environment: u8, receipt: &str) -> String {
    format!(
        r#"<consReciNFe xmlns="{NFE_NAMESPACE}" versao="4.00"><tpAmb>{environment}</tpAmb><nRec>{receipt}</nRec></consReciNFe>"#
    )
}

pub fn protocol_request(environment: u8, access_key: &str) -> String {
    format!(
        r#"<consSitNFe xmlns="{NFE_NAMESPACE}" versao="4.00"><tpAmb>{environment}</tpAmb><xServ>CONSULTAR</xServ><chNFe>{access_key}</chNFe></consSitNFe>"#
    )
}

const REPLY_ELEMENTS: &[&str] = &[
    "retConsStatServ",
    "retEnviNFe",
    "retConsReciNFe",
    "retConsSitNFe",
];

/// Reads status, message, receipt and the per-document protocol out of a SOAP reply
/// (or a bare `ret*` element).
pub fn parse_reply(raw: &str) -> Result<AuthorityReply> {
    let doc = roxmltree::Document::parse(raw).context("authority reply is not XML")?;
    let root = doc.root_element();

    if let Some(fault) = find_descendant(root, "Fault") {
        let reason = find_descendant(fault, "Text")
            .or_else(|| find_descendant(fault, "faultstring"))
            .and_then(|n| n.text())
            .unwrap_or("unspecified fault");
        bail!("SOAP fault: {}", reason.trim());
    }

    let ret = root
        .descendants()
        .find(|n| n.is_element() && REPLY_ELEMENTS.contains(&n.tag_name().name()))
        .ok_or_else(|| anyhow!("reply has no recognised ret* element"))?;

    let status_code = child_text(ret, "cStat")
        .ok_or_else(|| anyhow!("reply has no cStat"))?
        .parse::<u16>()
        .context("cStat is not numeric")?;
    let message = child_text(ret, "xMotivo").unwrap_or_default();
    let receipt = find_element(ret, &["infRec", "nRec"])
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .or_else(|| child_text(ret, "nRec"));
    let received_at = child_text(ret, "dhRecbto");

    let protocol = match find_descendant(ret, "protNFe") {
        Some(prot) => {
            let inf = find_element(prot, &["infProt"])
                .ok_or_else(|| anyhow!("protNFe has no infProt"))?;
            Some(InnerProtocol {
                access_key: child_text(inf, "chNFe").unwrap_or_default(),
                protocol_number: child_text(inf, "nProt").unwrap_or_default(),
                status_code: child_text(inf, "cStat")
                    .ok_or_else(|| anyhow!("infProt has no cStat"))?
                    .parse()
                    .context("infProt cStat is not numeric")?,
                message: child_text(inf, "xMotivo").unwrap_or_default(),
                received_at: child_text(inf, "dhRecbto"),
                raw: raw[prot.range()].to_string(),
            })
        }
        None => None,
    };

    Ok(AuthorityReply {
        status_code,
        message,
        receipt,
        received_at,
        protocol,
        raw: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_reply() {
        let raw = r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><nfeResultMsg xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeStatusServico4"><retConsStatServ versao="4.00" xmlns="http://www.portalfiscal.inf.br/nfe"><tpAmb>2</tpAmb><cStat>107</cStat><xMotivo>Servico em Operacao</xMotivo><cUF>35</cUF><dhRecbto>2024-06-15T10:00:00-03:00</dhRecbto></retConsStatServ></nfeResultMsg></soap:Body></soap:Envelope>"#;
        let reply = parse_reply(raw).unwrap();
        assert_eq!(reply.status_code, 107);
        assert_eq!(reply.message, "Servico em Operacao");
        assert_eq!(reply.received_at.as_deref(), Some("2024-06-15T10:00:00-03:00"));
        assert!(reply.protocol.is_none());
    }

    #[test]
    fn parses_receipt_and_inner_protocol() {
        let raw = r#"<retConsReciNFe xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><tpAmb>2</tpAmb><nRec>351000000000001</nRec><cStat>104</cStat><xMotivo>Lote processado</xMotivo><protNFe versao="4.00"><infProt><chNFe>35240612345678000195550010000000011123456787</chNFe><dhRecbto>2024-06-15T10:00:05-03:00</dhRecbto><nProt>135240000000001</nProt><cStat>100</cStat><xMotivo>Autorizado o uso da NF-e</xMotivo></infProt></protNFe></retConsReciNFe>"#;
        let reply = parse_reply(raw).unwrap();
        assert_eq!(reply.status_code, 104);
        assert_eq!(reply.receipt.as_deref(), Some("351000000000001"));
        let prot = reply.protocol.unwrap();
        assert_eq!(prot.status_code, 100);
        assert_eq!(prot.protocol_number, "135240000000001");
        assert!(prot.raw.starts_with("<protNFe"));
        assert!(prot.raw.ends_with("</protNFe>"));
    }

    #[test]
    fn batch_receipt_is_read_from_inf_rec() {
        let raw = r#"<retEnviNFe xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><cStat>103</cStat><xMotivo>Lote recebido com sucesso</xMotivo><infRec><nRec>351000000000002</nRec><tMed>1</tMed></infRec></retEnviNFe>"#;
        let reply = parse_reply(raw).unwrap();
        assert_eq!(reply.status_code, 103);
        assert_eq!(reply.receipt.as_deref(), Some("351000000000002"));
    }

    #[test]
    fn soap_fault_is_an_error() {
        let raw = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body><soap:Fault><soap:Reason><soap:Text>Server was unable to process request</soap:Text></soap:Reason></soap:Fault></soap:Body></soap:Envelope>"#;
        let err = parse_reply(raw).unwrap_err();
        assert!(err.to_string().contains("unable to process"));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_reply("<html>oops</html>").is_err());
        assert!(parse_reply("not xml").is_err());
    }

    #[test]
    fn declaration_is_stripped_before_embedding() {
        let body = batch_request("1", "<?xml version=\"1.0\"?>\n<NFe/>");
        assert!(body.contains("<indSinc>0</indSinc><NFe/></enviNFe>"));
    }
}
