//! Unsigned NFe 4.00 document construction.
//!
//! The default builder emits the minimal set of groups needed for a consumer sale
//! (`ide`, `emit`, `dest`, `det`, `total`, `transp`, `pag`, `infAdic`). Tax values are
//! zeroed: no tax computation happens here.

use chrono::FixedOffset;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use rust_decimal::{Decimal, RoundingStrategy};
use std::io::Cursor;

use crate::access_key::{digits_only, AccessKey};
use crate::error::{NfeError, NfeResult};
use crate::models::{Environment, IssuerProfile, Sale};

pub const NFE_NAMESPACE: &str = "http://www.portalfiscal.inf.br/nfe";
pub const NFE_VERSION: &str = "4.00";

const HOMOLOGATION_NOTICE: &str = "NF-e emitida em ambiente de homologacao - sem valor fiscal";
const HOMOLOGATION_RECIPIENT: &str = "NF-E EMITIDA EM AMBIENTE DE HOMOLOGACAO - SEM VALOR FISCAL";

/// Produces the unsigned fiscal XML for a validated sale. Must be deterministic.
pub trait DocumentBuilder: Send + Sync {
    fn build(&self, sale: &Sale, issuer: &IssuerProfile, key: &AccessKey) -> NfeResult<String>;
}

#[derive(Debug, Clone)]
pub struct NfeXmlBuilder {
    pub nature_of_operation: String,
    pub application_version: String,
}

impl Default for NfeXmlBuilder {
    fn default() -> Self {
        Self {
            nature_of_operation: "Venda de mercadoria".to_string(),
            application_version: concat!("nfe-issuer ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Fixed two-decimal representation used for every monetary field.
pub fn format_amount(value: Decimal) -> String {
    format!(
        "{:.2}",
        value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    )
}

fn format_quantity(quantity: u32) -> String {
    format!("{quantity}.0000")
}

fn xml_err(e: quick_xml::Error) -> NfeError {
    NfeError::InternalError(format!("XML write error: {e}"))
}

struct XmlOut {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlOut {
    fn new() -> NfeResult<Self> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;
        Ok(Self { writer })
    }

    fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> NfeResult<()> {
        let mut elem = BytesStart::new(name);
        for (k, v) in attrs {
            elem.push_attribute((*k, *v));
        }
        self.writer
            .write_event(Event::Start(elem))
            .map_err(xml_err)
    }

    fn end(&mut self, name: &str) -> NfeResult<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(xml_err)
    }

    fn text(&mut self, name: &str, value: &str) -> NfeResult<()> {
        self.start(name, &[])?;
        self.writer
            .write_event(Event::Text(BytesText::new(value)))
            .map_err(xml_err)?;
        self.end(name)
    }

    fn text_opt(&mut self, name: &str, value: &str) -> NfeResult<()> {
        if value.trim().is_empty() {
            return Ok(());
        }
        self.text(name, value.trim())
    }

    fn into_string(self) -> NfeResult<String> {
        let buf = self.writer.into_inner().into_inner();
        String::from_utf8(buf)
            .map_err(|e| NfeError::InternalError(format!("XML UTF-8 error: {e}")))
    }
}

impl DocumentBuilder for NfeXmlBuilder {
    fn build(&self, sale: &Sale, issuer: &IssuerProfile, key: &AccessKey) -> NfeResult<String> {
        let number = sale.document_number.ok_or_else(|| {
            NfeError::InvalidArgument(format!("sale {} has no document number", sale.id))
        })?;
        let series = sale.series.unwrap_or(issuer.series);
        let total = format_amount(sale.total());

        let mut w = XmlOut::new()?;
        w.start("NFe", &[("xmlns", NFE_NAMESPACE)])?;
        let id = format!("NFe{key}");
        w.start("infNFe", &[("versao", NFE_VERSION), ("Id", id.as_str())])?;

        self.write_ide(&mut w, sale, issuer, key, number, series)?;
        write_emit(&mut w, issuer)?;
        write_dest(&mut w, sale, issuer)?;
        write_items(&mut w, sale, issuer)?;

        w.start("total", &[])?;
        w.start("ICMSTot", &[])?;
        for field in [
            "vBC", "vICMS", "vICMSDeson", "vFCP", "vBCST", "vST", "vFCPST", "vFCPSTRet",
        ] {
            w.text(field, "0.00")?;
        }
        w.text("vProd", &total)?;
        for field in [
            "vFrete", "vSeg", "vDesc", "vII", "vIPI", "vIPIDevol", "vPIS", "vCOFINS", "vOutro",
        ] {
            w.text(field, "0.00")?;
        }
        w.text("vNF", &total)?;
        w.end("ICMSTot")?;
        w.end("total")?;

        w.start("transp", &[])?;
        w.text("modFrete", "9")?;
        w.end("transp")?;

        w.start("pag", &[])?;
        w.start("detPag", &[])?;
        w.text("indPag", "0")?;
        w.text("tPag", "01")?;
        w.text("vPag", &total)?;
        w.end("detPag")?;
        w.end("pag")?;

        let mut notes = sale.notes.trim().to_string();
        if issuer.environment == Environment::Homologation {
            if !notes.is_empty() {
                notes.push_str(" | ");
            }
            notes.push_str(HOMOLOGATION_NOTICE);
        }
        if !notes.is_empty() {
            w.start("infAdic", &[])?;
            w.text("infCpl", &notes)?;
            w.end("infAdic")?;
        }

        w.end("infNFe")?;
        w.end("NFe")?;
        w.into_string()
    }
}

impl NfeXmlBuilder {
    fn write_ide(
        &self,
        w: &mut XmlOut,
        sale: &Sale,
        issuer: &IssuerProfile,
        key: &AccessKey,
        number: u32,
        series: u16,
    ) -> NfeResult<()> {
        // Brasília time, no daylight saving since 2019.
        let brt = FixedOffset::west_opt(3 * 3600)
            .ok_or_else(|| NfeError::InternalError("invalid UTC offset".into()))?;
        let issued_at = sale
            .sold_at
            .with_timezone(&brt)
            .format("%Y-%m-%dT%H:%M:%S%:z")
            .to_string();

        w.start("ide", &[])?;
        w.text("cUF", key.region_code())?;
        w.text("cNF", key.numeric_code())?;
        w.text("natOp", &self.nature_of_operation)?;
        w.text("mod", key.model())?;
        w.text("serie", &series.to_string())?;
        w.text("nNF", &number.to_string())?;
        w.text("dhEmi", &issued_at)?;
        w.text("tpNF", "1")?;
        w.text("idDest", "1")?;
        w.text("cMunFG", &issuer.municipality_code.to_string())?;
        w.text("tpImp", "1")?;
        w.text("tpEmis", key.emission_type())?;
        w.text("cDV", &key.check_digit().to_string())?;
        w.text("tpAmb", &issuer.environment.code().to_string())?;
        w.text("finNFe", "1")?;
        w.text("indFinal", "1")?;
        w.text("indPres", "1")?;
        w.text("procEmi", "0")?;
        w.text("verProc", &self.application_version)?;
        w.end("ide")
    }
}

fn write_address(
    w: &mut XmlOut,
    tag: &str,
    street: &str,
    number: &str,
    district: &str,
    issuer: &IssuerProfile,
    postal_code: &str,
) -> NfeResult<()> {
    w.start(tag, &[])?;
    w.text("xLgr", street)?;
    w.text("nro", if number.trim().is_empty() { "S/N" } else { number })?;
    w.text_opt("xBairro", district)?;
    w.text("cMun", &issuer.municipality_code.to_string())?;
    w.text("xMun", &issuer.municipality_name)?;
    w.text("UF", &issuer.uf.to_ascii_uppercase())?;
    w.text_opt("CEP", &digits_only(postal_code))?;
    w.text("cPais", "1058")?;
    w.text("xPais", "Brasil")?;
    w.end(tag)
}

fn write_emit(w: &mut XmlOut, issuer: &IssuerProfile) -> NfeResult<()> {
    w.start("emit", &[])?;
    w.text("CNPJ", &format!("{:0>14}", digits_only(&issuer.cnpj)))?;
    w.text("xNome", &issuer.legal_name)?;
    w.text_opt("xFant", &issuer.trade_name)?;
    write_address(
        w,
        "enderEmit",
        &issuer.address,
        &issuer.address_number,
        &issuer.district,
        issuer,
        &issuer.postal_code,
    )?;
    w.text_opt("IE", &digits_only(&issuer.state_registration))?;
    w.text("CRT", &issuer.tax_regime.to_string())?;
    w.end("emit")
}

fn write_dest(w: &mut XmlOut, sale: &Sale, issuer: &IssuerProfile) -> NfeResult<()> {
    let document = digits_only(&sale.client_document);

    w.start("dest", &[])?;
    if document.len() == 11 {
        w.text("CPF", &document)?;
    } else {
        w.text("CNPJ", &format!("{document:0>14}"))?;
    }
    let name = match issuer.environment {
        Environment::Homologation => HOMOLOGATION_RECIPIENT,
        Environment::Production => sale.client_name.as_str(),
    };
    w.text("xNome", name)?;
    // Recipient address shares the issuer's municipality.
    write_address(w, "enderDest", &sale.client_address, "", "", issuer, "")?;
    w.text("indIEDest", "9")?;
    w.end("dest")
}

fn write_items(w: &mut XmlOut, sale: &Sale, issuer: &IssuerProfile) -> NfeResult<()> {
    let simples = matches!(issuer.tax_regime, 1 | 2);

    for (idx, item) in sale.items.iter().enumerate() {
        let n_item = (idx + 1).to_string();
        let quantity = format_quantity(item.quantity);
        let unit_price = format_amount(item.unit_price);

        w.start("det", &[("nItem", n_item.as_str())])?;
        w.start("prod", &[])?;
        w.text("cProd", &item.code)?;
        w.text("cEAN", "SEM GTIN")?;
        w.text("xProd", &item.description)?;
        w.text("NCM", &digits_only(&item.ncm))?;
        w.text("CFOP", &digits_only(&item.cfop))?;
        w.text("uCom", &item.unit)?;
        w.text("qCom", &quantity)?;
        w.text("vUnCom", &unit_price)?;
        w.text("vProd", &format_amount(item.total()))?;
        w.text("cEANTrib", "SEM GTIN")?;
        w.text("uTrib", &item.unit)?;
        w.text("qTrib", &quantity)?;
        w.text("vUnTrib", &unit_price)?;
        w.text("indTot", "1")?;
        w.end("prod")?;

        w.start("imposto", &[])?;
        w.start("ICMS", &[])?;
        if simples {
            w.start("ICMSSN102", &[])?;
            w.text("orig", "0")?;
            w.text("CSOSN", "102")?;
            w.end("ICMSSN102")?;
        } else {
            w.start("ICMS40", &[])?;
            w.text("orig", "0")?;
            w.text("CST", "41")?;
            w.end("ICMS40")?;
        }
        w.end("ICMS")?;
        w.start("PIS", &[])?;
        w.start("PISNT", &[])?;
        w.text("CST", "07")?;
        w.end("PISNT")?;
        w.end("PIS")?;
        w.start("COFINS", &[])?;
        w.start("COFINSNT", &[])?;
        w.text("CST", "07")?;
        w.end("COFINSNT")?;
        w.end("COFINS")?;
        w.end("imposto")?;
        w.end("det")?;
    }
    Ok(())
}
