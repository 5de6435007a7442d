//! Enveloped XML-DSig (RSA-SHA256, C14N 1.0, SHA-256 digest).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use nfe_core::error::{NfeError, NfeResult};
use roxmltree::{Document, Node};
use sha2::{Digest, Sha256};

use crate::c14n::{canonicalize_document, canonicalize_subtree};
use crate::handle::CertificateHandle;
use crate::material::{describe, verify_sha256, SigningCertificate};

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const C14N_ALG: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
const RSA_SHA256_ALG: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const SHA256_ALG: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const ENVELOPED_ALG: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// What the single `Reference` points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceScope {
    /// `URI=""`: the whole document.
    #[default]
    WholeDocument,
    /// `URI="#<Id>"`: the first child of the root carrying an `Id` attribute
    /// (`infNFe` for NFe documents).
    IdentifiedElement,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XmlSigner {
    pub scope: ReferenceScope,
}

fn signing_failed(msg: impl std::fmt::Display) -> NfeError {
    NfeError::SigningFailed(msg.to_string())
}

fn parse(xml: &str) -> NfeResult<Document<'_>> {
    Document::parse(xml).map_err(|e| signing_failed(format!("document is not well-formed XML: {e}")))
}

fn digest_b64(canonical: &str) -> String {
    STANDARD.encode(Sha256::digest(canonical.as_bytes()))
}

fn is_dsig(node: &Node, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name && node.tag_name().namespace() == Some(DSIG_NS)
}

fn dsig_child<'a, 'input>(parent: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    parent.children().find(|n| is_dsig(n, name))
}

fn signed_info(digest: &str, uri: &str) -> String {
    format!(
        "<SignedInfo>\
<CanonicalizationMethod Algorithm=\"{C14N_ALG}\"></CanonicalizationMethod>\
<SignatureMethod Algorithm=\"{RSA_SHA256_ALG}\"></SignatureMethod>\
<Reference URI=\"{uri}\">\
<Transforms>\
<Transform Algorithm=\"{ENVELOPED_ALG}\"></Transform>\
<Transform Algorithm=\"{C14N_ALG}\"></Transform>\
</Transforms>\
<DigestMethod Algorithm=\"{SHA256_ALG}\"></DigestMethod>\
<DigestValue>{digest}</DigestValue>\
</Reference>\
</SignedInfo>"
    )
}

fn signature_element(signed_info: &str, value: &str, certificate_b64: &str) -> String {
    format!(
        "<Signature xmlns=\"{DSIG_NS}\">{signed_info}<SignatureValue>{value}</SignatureValue>\
<KeyInfo><X509Data><X509Certificate>{certificate_b64}</X509Certificate></X509Data></KeyInfo>\
</Signature>"
    )
}

/// Inserts `fragment` as the last child of the root element, expanding a self-closing root.
fn insert_before_root_end(xml: &str, root: Node, fragment: &str) -> NfeResult<String> {
    let range = root.range();
    let element = &xml[range.clone()];

    if element.ends_with("/>") && !root.has_children() {
        let name_len = element[1..]
            .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
            .ok_or_else(|| signing_failed("cannot locate root tag name"))?;
        let qname = &element[1..1 + name_len];
        let open = element[..element.len() - 2].trim_end();
        return Ok(format!(
            "{}{open}>{fragment}</{qname}>{}",
            &xml[..range.start],
            &xml[range.end..]
        ));
    }

    let end_tag = element
        .rfind("</")
        .ok_or_else(|| signing_failed("cannot locate root end tag"))?;
    let at = range.start + end_tag;
    Ok(format!("{}{fragment}{}", &xml[..at], &xml[at..]))
}

fn referenced_element<'a, 'input>(
    root: Node<'a, 'input>,
) -> NfeResult<(Node<'a, 'input>, &'a str)> {
    root.children()
        .filter(Node::is_element)
        .find_map(|n| n.attribute("Id").map(|id| (n, id)))
        .ok_or_else(|| signing_failed("no child of the root element carries an Id attribute"))
}

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedSignature {
    pub signer: CertificateHandle,
    pub reference_uri: String,
}

impl XmlSigner {
    pub fn new(scope: ReferenceScope) -> Self {
        Self { scope }
    }

    /// Signs `xml` and returns the signed document bytes (UTF-8).
    pub fn sign(&self, xml: &str, certificate: &SigningCertificate) -> NfeResult<Vec<u8>> {
        if xml.trim().is_empty() {
            return Err(NfeError::InvalidArgument("document to sign is empty".into()));
        }
        if !certificate.has_private_key() {
            return Err(signing_failed("certificate has no private key"));
        }

        let doc = parse(xml)?;
        let root = doc.root_element();

        let (uri, canonical) = match self.scope {
            ReferenceScope::WholeDocument => (String::new(), canonicalize_document(&doc, None)),
            ReferenceScope::IdentifiedElement => {
                let (node, id) = referenced_element(root)?;
                (format!("#{id}"), canonicalize_subtree(node, None))
            }
        };
        let info = signed_info(&digest_b64(&canonical), &uri);
        let cert_b64 = certificate.certificate_base64();

        // SignedInfo must be canonicalised in its final context to pick up inherited namespaces.
        let draft = insert_before_root_end(xml, root, &signature_element(&info, "", &cert_b64))?;
        let draft_doc = parse(&draft)?;
        let draft_info = draft_doc
            .root_element()
            .children()
            .filter(|n| is_dsig(n, "Signature"))
            .last()
            .and_then(|sig| sig.children().find(|n| is_dsig(n, "SignedInfo")))
            .ok_or_else(|| signing_failed("inserted signature could not be located"))?;
        let canonical_info = canonicalize_subtree(draft_info, None);

        let value = STANDARD.encode(certificate.sign_sha256(canonical_info.as_bytes())?);
        let signed = insert_before_root_end(xml, root, &signature_element(&info, &value, &cert_b64))?;

        tracing::debug!(
            thumbprint = %certificate.handle().thumbprint,
            reference = %uri,
            "document signed"
        );
        Ok(signed.into_bytes())
    }

    /// Checks the last `Signature` under the root: reference digest, then the RSA signature
    /// over SignedInfo with the embedded certificate.
    pub fn verify(&self, signed: &str) -> NfeResult<VerifiedSignature> {
        let doc = parse(signed)?;
        let root = doc.root_element();
        let signature = root
            .children()
            .filter(|n| is_dsig(n, "Signature"))
            .last()
            .ok_or_else(|| signing_failed("document has no Signature element"))?;

        let info = dsig_child(signature, "SignedInfo")
            .ok_or_else(|| signing_failed("Signature has no SignedInfo"))?;
        let reference = dsig_child(info, "Reference")
            .ok_or_else(|| signing_failed("SignedInfo has no Reference"))?;
        let uri = reference.attribute("URI").unwrap_or_default().to_string();
        let expected_digest = dsig_child(reference, "DigestValue")
            .and_then(|n| n.text())
            .map(str::trim)
            .ok_or_else(|| signing_failed("Reference has no DigestValue"))?;
        let value = dsig_child(signature, "SignatureValue")
            .and_then(|n| n.text())
            .map(|t| t.split_whitespace().collect::<String>())
            .ok_or_else(|| signing_failed("Signature has no SignatureValue"))?;
        let cert_b64 = signature
            .descendants()
            .find(|n| is_dsig(n, "X509Certificate"))
            .and_then(|n| n.text())
            .map(|t| t.split_whitespace().collect::<String>())
            .ok_or_else(|| signing_failed("Signature has no X509Certificate"))?;

        let canonical = if uri.is_empty() {
            canonicalize_document(&doc, Some(signature.id()))
        } else {
            let id = uri.trim_start_matches('#');
            let target = doc
                .descendants()
                .find(|n| n.attribute("Id") == Some(id))
                .ok_or_else(|| signing_failed(format!("referenced element {uri} not found")))?;
            canonicalize_subtree(target, Some(signature.id()))
        };
        if digest_b64(&canonical) != expected_digest {
            return Err(signing_failed("digest mismatch: document was modified after signing"));
        }

        let cert_der = STANDARD
            .decode(cert_b64)
            .map_err(|e| signing_failed(format!("embedded certificate is not base64: {e}")))?;
        let signature_bytes = STANDARD
            .decode(value)
            .map_err(|e| signing_failed(format!("signature value is not base64: {e}")))?;
        verify_sha256(
            &cert_der,
            canonicalize_subtree(info, None).as_bytes(),
            &signature_bytes,
        )?;

        Ok(VerifiedSignature {
            signer: describe(&cert_der)?,
            reference_uri: uri,
        })
    }
}
