//! OAI-PMH 2.0 client.
//!
//! Supports the two verbs the preprint harvester needs:
//!
//! - `ListRecords` with `metadataPrefix`, optional `from` / `until` / `set`,
//!   paged through `resumptionToken`
//! - `GetRecord` for a single identifier
//!
//! Responses are parsed with `quick_xml`. Only Dublin Core children of a
//! record's `<metadata>` are kept, as [`DcElement`]s in document order.
//! An OAI `noRecordsMatch` error is an empty page; any other OAI error
//! fails the request.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::config::PreprintSourceConfig;
use crate::error::HarvestError;
use crate::http::{build_url, HttpFetcher};

/// One Dublin Core element, e.g. `<dc:title xml:lang="pt">…</dc:title>`.
#[derive(Debug, Clone, PartialEq)]
pub struct DcElement {
    pub name: String,
    pub lang: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct OaiHeader {
    pub identifier: Option<String>,
    pub datestamp: Option<String>,
    pub deleted: bool,
    pub set_specs: Vec<String>,
}

impl OaiHeader {
    /// The datestamp as unix seconds. Accepts day and second granularity.
    pub fn datestamp_ts(&self) -> Option<i64> {
        self.datestamp.as_deref().and_then(parse_datestamp)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OaiRecord {
    pub header: OaiHeader,
    pub metadata: Vec<DcElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OaiError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct OaiPage {
    pub records: Vec<OaiRecord>,
    /// Present and non-empty while more pages remain.
    pub resumption_token: Option<String>,
    pub complete_list_size: Option<u64>,
    pub error: Option<OaiError>,
}

pub fn parse_datestamp(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc).timestamp());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

/// Formats a unix timestamp as an OAI `from` argument (day granularity).
pub fn format_from_date(ts: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.format("%Y-%m-%d").to_string())
}

pub struct OaiClient {
    fetcher: HttpFetcher,
    base_url: String,
    metadata_prefix: String,
    set: Option<String>,
}

impl OaiClient {
    pub fn new(fetcher: HttpFetcher, config: &PreprintSourceConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| HarvestError::config("sources.preprints.base_url is not set"))?;
        Ok(Self {
            fetcher,
            base_url,
            metadata_prefix: config.metadata_prefix.clone(),
            set: config.set.clone(),
        })
    }

    /// Fetches one `ListRecords` page. With a token, the other arguments are
    /// omitted as the protocol requires.
    pub async fn list_records(
        &self,
        from: Option<&str>,
        until: Option<&str>,
        resumption_token: Option<&str>,
    ) -> Result<OaiPage> {
        let mut params = vec![("verb", "ListRecords".to_string())];
        match resumption_token {
            Some(token) => params.push(("resumptionToken", token.to_string())),
            None => {
                params.push(("metadataPrefix", self.metadata_prefix.clone()));
                if let Some(from) = from {
                    params.push(("from", from.to_string()));
                }
                if let Some(until) = until {
                    params.push(("until", until.to_string()));
                }
                if let Some(set) = &self.set {
                    params.push(("set", set.clone()));
                }
            }
        }

        let url = build_url(&self.base_url, &[], &params)?;
        let body = self.fetcher.get_text(&url).await?;
        let page = parse_response(&body)?;
        check_error(&page)?;
        Ok(page)
    }

    /// Fetches a single record; `None` when the repository does not know it.
    pub async fn get_record(&self, identifier: &str) -> Result<Option<OaiRecord>> {
        let params = vec![
            ("verb", "GetRecord".to_string()),
            ("metadataPrefix", self.metadata_prefix.clone()),
            ("identifier", identifier.to_string()),
        ];
        let url = build_url(&self.base_url, &[], &params)?;
        let body = self.fetcher.get_text(&url).await?;
        let page = parse_response(&body)?;
        if let Some(err) = &page.error {
            if err.code == "idDoesNotExist" {
                return Ok(None);
            }
        }
        check_error(&page)?;
        Ok(page.records.into_iter().next())
    }
}

fn check_error(page: &OaiPage) -> Result<()> {
    match &page.error {
        None => Ok(()),
        Some(err) if err.code == "noRecordsMatch" => Ok(()),
        Some(err) => bail!("OAI-PMH error {}: {}", err.code, err.message),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Response parsing
// ═══════════════════════════════════════════════════════════════════════

enum Capture {
    Identifier,
    Datestamp,
    SetSpec,
    Dc(DcElement),
    Token,
    Error(String),
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// An element is Dublin Core when it carries the `dc` prefix or sits
/// directly under an `oai_dc:dc` container.
fn is_dc(e: &BytesStart, parent: Option<&str>) -> bool {
    let prefixed = e
        .name()
        .prefix()
        .map(|p| p.as_ref() == b"dc")
        .unwrap_or(false);
    prefixed || parent == Some("dc")
}

/// Parses a `ListRecords` or `GetRecord` response.
pub fn parse_response(xml: &str) -> Result<OaiPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = OaiPage::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<OaiRecord> = None;
    let mut capture: Option<(usize, Capture, String)> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = local_name(&e);
                let in_record = current.is_some();
                let in_header = in_record && stack.iter().any(|s| s == "header");
                let in_metadata = in_record && stack.iter().any(|s| s == "metadata");
                let parent = stack.last().map(String::as_str);

                if capture.is_none() {
                    let kind = match name.as_str() {
                        "record" if !in_record => {
                            current = Some(OaiRecord::default());
                            None
                        }
                        "header" if in_record && !in_metadata => {
                            if let Some(rec) = current.as_mut() {
                                rec.header.deleted =
                                    attribute(&e, b"status")?.as_deref() == Some("deleted");
                            }
                            None
                        }
                        "identifier" if in_header => Some(Capture::Identifier),
                        "datestamp" if in_header => Some(Capture::Datestamp),
                        "setSpec" if in_header => Some(Capture::SetSpec),
                        _ if in_metadata && is_dc(&e, parent) => Some(Capture::Dc(DcElement {
                            name: name.clone(),
                            lang: attribute(&e, b"xml:lang")?,
                            text: String::new(),
                        })),
                        "resumptionToken" => {
                            page.complete_list_size = attribute(&e, b"completeListSize")?
                                .and_then(|s| s.parse().ok());
                            Some(Capture::Token)
                        }
                        "error" if !in_record => Some(Capture::Error(
                            attribute(&e, b"code")?.unwrap_or_default(),
                        )),
                        _ => None,
                    };
                    if let Some(kind) = kind {
                        capture = Some((stack.len(), kind, String::new()));
                    }
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                match name.as_str() {
                    // <resumptionToken/> marks the last page
                    "resumptionToken" => {
                        page.complete_list_size = attribute(&e, b"completeListSize")?
                            .and_then(|s| s.parse().ok());
                    }
                    "header" if current.is_some() => {
                        if let Some(rec) = current.as_mut() {
                            rec.header.deleted =
                                attribute(&e, b"status")?.as_deref() == Some("deleted");
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                if let Some((_, _, buf)) = capture.as_mut() {
                    buf.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some((_, _, buf)) = capture.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                stack.pop();
                let closes_capture = matches!(&capture, Some((depth, _, _)) if *depth == stack.len());
                if closes_capture {
                    if let Some((_, kind, text)) = capture.take() {
                        let text = text.trim().to_string();
                        match kind {
                            Capture::Identifier => {
                                if let Some(rec) = current.as_mut() {
                                    rec.header.identifier = Some(text).filter(|t| !t.is_empty());
                                }
                            }
                            Capture::Datestamp => {
                                if let Some(rec) = current.as_mut() {
                                    rec.header.datestamp = Some(text).filter(|t| !t.is_empty());
                                }
                            }
                            Capture::SetSpec => {
                                if let Some(rec) = current.as_mut() {
                                    rec.header.set_specs.push(text);
                                }
                            }
                            Capture::Dc(mut element) => {
                                element.text = text;
                                if let Some(rec) = current.as_mut() {
                                    rec.metadata.push(element);
                                }
                            }
                            Capture::Token => {
                                page.resumption_token = Some(text).filter(|t| !t.is_empty());
                            }
                            Capture::Error(code) => {
                                page.error = Some(OaiError { code, message: text });
                            }
                        }
                    }
                } else if current.is_some() && !stack.iter().any(|s| s == "record") {
                    if let Some(rec) = current.take() {
                        page.records.push(rec);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(page)
}

/// Collects every Dublin Core element of a standalone record document.
pub fn parse_dc_elements(xml: &str) -> Result<Vec<DcElement>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut out = Vec::new();
    let mut capture: Option<(usize, DcElement)> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = local_name(&e);
                if capture.is_none() && is_dc(&e, stack.last().map(String::as_str)) {
                    capture = Some((
                        stack.len(),
                        DcElement {
                            name: name.clone(),
                            lang: attribute(&e, b"xml:lang")?,
                            text: String::new(),
                        },
                    ));
                }
                stack.push(name);
            }
            Event::Text(t) => {
                if let Some((_, el)) = capture.as_mut() {
                    el.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some((_, el)) = capture.as_mut() {
                    el.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                stack.pop();
                if matches!(&capture, Some((depth, _)) if *depth == stack.len()) {
                    if let Some((_, mut el)) = capture.take() {
                        el.text = el.text.trim().to_string();
                        out.push(el);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_RECORDS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-06-01T00:00:00Z</responseDate>
  <request verb="ListRecords">https://preprints.example/oai</request>
  <ListRecords>
    <record>
      <header>
        <identifier>oai:preprints.example:preprint/1</identifier>
        <datestamp>2024-05-20T10:00:00Z</datestamp>
        <setSpec>health</setSpec>
      </header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/"
                   xmlns:dc="http://purl.org/dc/elements/1.1/">
          <dc:title xml:lang="pt">Titulo &amp; teste</dc:title>
          <dc:creator>Silva, Maria</dc:creator>
          <dc:identifier>https://preprints.example/1</dc:identifier>
        </oai_dc:dc>
      </metadata>
    </record>
    <record>
      <header status="deleted">
        <identifier>oai:preprints.example:preprint/2</identifier>
        <datestamp>2024-05-21</datestamp>
      </header>
    </record>
    <resumptionToken completeListSize="250">token-abc</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;

    #[test]
    fn test_parse_list_records_page() {
        let page = parse_response(LIST_RECORDS).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.resumption_token.as_deref(), Some("token-abc"));
        assert_eq!(page.complete_list_size, Some(250));

        let first = &page.records[0];
        assert_eq!(
            first.header.identifier.as_deref(),
            Some("oai:preprints.example:preprint/1")
        );
        assert!(!first.header.deleted);
        assert_eq!(first.header.set_specs, vec!["health"]);
        assert_eq!(first.metadata.len(), 3);
        assert_eq!(first.metadata[0].name, "title");
        assert_eq!(first.metadata[0].lang.as_deref(), Some("pt"));
        assert_eq!(first.metadata[0].text, "Titulo & teste");

        assert!(page.records[1].header.deleted);
        assert!(page.records[1].metadata.is_empty());
    }

    #[test]
    fn test_empty_token_ends_listing() {
        let xml = r#"<OAI-PMH><ListRecords><resumptionToken completeListSize="2"/></ListRecords></OAI-PMH>"#;
        let page = parse_response(xml).unwrap();
        assert!(page.resumption_token.is_none());
        assert_eq!(page.complete_list_size, Some(2));
    }

    #[test]
    fn test_oai_errors() {
        let xml = r#"<OAI-PMH><error code="noRecordsMatch">nothing</error></OAI-PMH>"#;
        let page = parse_response(xml).unwrap();
        assert!(page.records.is_empty());
        assert!(check_error(&page).is_ok());

        let xml = r#"<OAI-PMH><error code="badResumptionToken">expired</error></OAI-PMH>"#;
        let page = parse_response(xml).unwrap();
        let err = check_error(&page).unwrap_err();
        assert!(err.to_string().contains("badResumptionToken"));
    }

    #[test]
    fn test_datestamp_granularities() {
        assert_eq!(parse_datestamp("2024-05-20"), Some(1716163200));
        assert_eq!(parse_datestamp("2024-05-20T00:00:00Z"), Some(1716163200));
        assert_eq!(parse_datestamp("yesterday"), None);
        assert_eq!(format_from_date(1716163200).as_deref(), Some("2024-05-20"));
    }

    #[test]
    fn test_parse_dc_elements_standalone() {
        let xml = r#"<record xmlns:dc="http://purl.org/dc/elements/1.1/">
            <dc:title xml:lang="pt">Titulo de teste</dc:title>
            <other>ignored</other>
            <dc:language>pt</dc:language>
        </record>"#;
        let elements = parse_dc_elements(xml).unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[1].name, "language");
        assert_eq!(elements[1].text, "pt");
    }
}
