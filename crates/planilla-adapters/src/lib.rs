//! Portal adapter: request contracts, HTML scraping and report normalization
//! for the comptroller's public payroll portal.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use planilla_core::{parse_portal_timestamp, Institution, NormalizedReport, WorkItem};
use planilla_storage::{HttpError, HttpFetcher};
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;

mod report;

pub use report::{
    archivo_from_content_disposition, decode_workbook, normalize_column_label, normalize_report,
    normalize_sheets, ReportLayout, SheetGrid, FALLBACK_ARCHIVO,
};

pub const CRATE_NAME: &str = "planilla-adapters";

pub const DEFAULT_INDEX_URL: &str = "https://www.contraloria.gob.pa/CGR.PLANILLAGOB.UI/Formas/Index";
pub const DEFAULT_REPORT_URL: &str =
    "https://www.contraloria.gob.pa/CGR.PLANILLAGOB.UI/Formas/Reporte";

pub const INSTITUTION_SELECT: &str = "select#MainContent_ddlInstituciones";
pub const PLACEHOLDER_OPTION: &str = "-- Seleccione una institución --";

static UPDATE_STAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Fecha de actualización de los datos:\s+(\d{1,2}/\d{1,2}/\d+\s+\d{1,2}:\d{1,2}:\d{1,2}\s+\w+)",
    )
    .expect("update stamp pattern is valid")
});

/// Run-level failures: without the index page nothing downstream can proceed.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal unavailable at {url}: {source}")]
    SourceUnavailable {
        url: String,
        #[source]
        source: HttpError,
    },
    #[error("portal layout changed at {url}: {detail}")]
    FormatMismatch { url: String, detail: String },
}

/// Why one work item could not be turned into a snapshot.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("download failed: {0}")]
    Transport(#[from] HttpError),
    #[error("payload is not an xlsx workbook (starts with {preview:?})")]
    NotASpreadsheet { preview: String },
    #[error("workbook could not be decoded: {0}")]
    Workbook(String),
    #[error("workbook has no sheets with data")]
    EmptyWorkbook,
    #[error("sheet {sheet:?} has {rows} rows; the layout needs at least {needed}")]
    SheetTooShort {
        sheet: String,
        rows: usize,
        needed: usize,
    },
    #[error("sheet {sheet:?} is missing required column {column:?}")]
    MissingColumn { sheet: String, column: &'static str },
    #[error("sheet {sheet:?} row {row}: column {column} is empty")]
    MissingValue {
        sheet: String,
        row: usize,
        column: &'static str,
    },
    #[error("sheet {sheet:?} row {row}: column {column} value {value:?} is not numeric")]
    NonNumeric {
        sheet: String,
        row: usize,
        column: &'static str,
        value: String,
    },
    #[error("first sheet has no update stamp at zero-based cell ({row}, {column})")]
    UpdatedAtMissing { row: usize, column: usize },
    #[error("update stamp {0:?} does not match DD/MM/YYYY hh:mm:ss AM|PM")]
    UpdatedAtInvalid(String),
    #[error("sheet {sheet:?} row {row}: start date {value:?} is not DD/MM/YYYY")]
    InvalidStartDate {
        sheet: String,
        row: usize,
        value: String,
    },
    #[error("normalization task failed: {0}")]
    Task(String),
    #[error("snapshot write failed: {0}")]
    Snapshot(String),
}

/// A failed work item together with its cause.
#[derive(Debug, Error)]
#[error("{item}: {cause}")]
pub struct FetchError {
    pub item: WorkItem,
    #[source]
    pub cause: ParseError,
}

impl FetchError {
    pub fn new(item: WorkItem, cause: impl Into<ParseError>) -> Self {
        Self {
            item,
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalEndpoints {
    pub index_url: String,
    pub report_url: String,
}

impl Default for PortalEndpoints {
    fn default() -> Self {
        Self {
            index_url: DEFAULT_INDEX_URL.to_string(),
            report_url: DEFAULT_REPORT_URL.to_string(),
        }
    }
}

impl PortalEndpoints {
    /// Report download URL; the empty `N`, `A` and `C` filters are part of
    /// the endpoint's query contract.
    pub fn report_url_for(&self, item: &WorkItem) -> String {
        format!(
            "{}?&Ne={}&N=&A=&C=&E={}",
            self.report_url,
            quote(item.institution.name()),
            quote(item.status.label())
        )
    }
}

/// Percent-escape like Python's `urllib.parse.quote`: `/` stays literal.
pub fn quote(input: &str) -> String {
    urlencoding::encode(input).replace("%2F", "/")
}

/// Raw report download for one work item.
#[derive(Debug, Clone)]
pub struct ReportPayload {
    pub url: String,
    pub content_disposition: Option<String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait PortalClient: Send + Sync {
    fn endpoints(&self) -> &PortalEndpoints;

    /// Index page as served to a plain GET; carries the update stamp.
    async fn update_page(&self) -> Result<String, PortalError>;

    /// Index page after a form postback; carries the institution list.
    async fn institution_form(&self) -> Result<String, PortalError>;

    async fn download_report(&self, item: &WorkItem) -> Result<ReportPayload, HttpError>;
}

#[derive(Debug, Clone)]
pub struct HttpPortalClient {
    http: Arc<HttpFetcher>,
    endpoints: PortalEndpoints,
}

impl HttpPortalClient {
    pub fn new(http: Arc<HttpFetcher>, endpoints: PortalEndpoints) -> Self {
        Self { http, endpoints }
    }
}

#[async_trait]
impl PortalClient for HttpPortalClient {
    fn endpoints(&self) -> &PortalEndpoints {
        &self.endpoints
    }

    async fn update_page(&self) -> Result<String, PortalError> {
        let url = &self.endpoints.index_url;
        self.http
            .get(url)
            .await
            .map(|resp| resp.text())
            .map_err(|source| PortalError::SourceUnavailable {
                url: url.clone(),
                source,
            })
    }

    async fn institution_form(&self) -> Result<String, PortalError> {
        let url = &self.endpoints.index_url;
        self.http
            .post_form(url)
            .await
            .map(|resp| resp.text())
            .map_err(|source| PortalError::SourceUnavailable {
                url: url.clone(),
                source,
            })
    }

    async fn download_report(&self, item: &WorkItem) -> Result<ReportPayload, HttpError> {
        let url = self.endpoints.report_url_for(item);
        let resp = self.http.get(&url).await?;
        Ok(ReportPayload {
            url,
            content_disposition: resp.content_disposition,
            body: resp.body,
        })
    }
}

fn capture_update_stamp(text: &str) -> Option<String> {
    UPDATE_STAMP_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Find and parse the "last updated" stamp of the index page.
///
/// The raw markup is tried first; entity-encoded pages are retried against the
/// document's decoded text.
pub fn extract_update_timestamp(html: &str) -> Option<NaiveDateTime> {
    let raw = capture_update_stamp(html).or_else(|| {
        let text = Html::parse_document(html)
            .root_element()
            .text()
            .collect::<String>();
        capture_update_stamp(&text)
    })?;
    parse_portal_timestamp(&raw)
}

/// Institution names listed by the selection form, in page order.
///
/// Returns `None` when the selection element is missing.
pub fn parse_institutions(html: &str) -> Option<Vec<Institution>> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(INSTITUTION_SELECT).ok()?;
    let select = document.select(&selector).next()?;

    let mut names = Vec::new();
    for line in select.text().flat_map(|t| t.split('\n')) {
        let name = line.trim();
        if name.is_empty() || name == PLACEHOLDER_OPTION {
            continue;
        }
        names.push(Institution::new(name));
    }
    Some(names)
}

pub async fn read_update_timestamp(client: &dyn PortalClient) -> Result<NaiveDateTime, PortalError> {
    let html = client.update_page().await?;
    extract_update_timestamp(&html).ok_or_else(|| PortalError::FormatMismatch {
        url: client.endpoints().index_url.clone(),
        detail: "no parsable \"Fecha de actualización de los datos\" stamp".to_string(),
    })
}

pub async fn read_institutions(client: &dyn PortalClient) -> Result<Vec<Institution>, PortalError> {
    let url = || client.endpoints().index_url.clone();
    let html = client.institution_form().await?;
    let names = parse_institutions(&html).ok_or_else(|| PortalError::FormatMismatch {
        url: url(),
        detail: format!("selection element {INSTITUTION_SELECT} not found"),
    })?;
    if names.is_empty() {
        return Err(PortalError::FormatMismatch {
            url: url(),
            detail: format!("selection element {INSTITUTION_SELECT} lists no institutions"),
        });
    }
    Ok(names)
}

/// Downloads and normalizes the report of one work item.
#[derive(Clone)]
pub struct ReportFetcher {
    client: Arc<dyn PortalClient>,
    layout: ReportLayout,
}

impl ReportFetcher {
    pub fn new(client: Arc<dyn PortalClient>) -> Self {
        Self::with_layout(client, ReportLayout::V1)
    }

    pub fn with_layout(client: Arc<dyn PortalClient>, layout: ReportLayout) -> Self {
        Self { client, layout }
    }

    pub async fn fetch(&self, item: &WorkItem) -> Result<NormalizedReport, FetchError> {
        let queried_at = Utc::now();
        let payload = self
            .client
            .download_report(item)
            .await
            .map_err(|err| FetchError::new(item.clone(), err))?;
        debug!(url = %payload.url, bytes = payload.body.len(), "report downloaded");

        let owned_item = item.clone();
        let layout = self.layout;
        let normalized = tokio::task::spawn_blocking(move || {
            normalize_report(&payload, &owned_item, queried_at, &layout)
        })
        .await
        .map_err(|err| ParseError::Task(err.to_string()))
        .and_then(|result| result);

        normalized.map_err(|cause| FetchError::new(item.clone(), cause))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use planilla_core::EmploymentStatus;

    #[test]
    fn report_url_matches_python_quote() {
        let endpoints = PortalEndpoints::default();
        let item = WorkItem::new(
            Institution::new("MINISTERIO DE EDUCACIÓN/MEDUCA"),
            EmploymentStatus::InterinoHastaFinDeAno,
        );
        assert_eq!(
            endpoints.report_url_for(&item),
            "https://www.contraloria.gob.pa/CGR.PLANILLAGOB.UI/Formas/Reporte\
             ?&Ne=MINISTERIO%20DE%20EDUCACI%C3%93N/MEDUCA&N=&A=&C=\
             &E=INTERINO%20HASTA%20FIN%20DE%20A%C3%91O"
        );
    }

    #[test]
    fn quote_keeps_unreserved_characters() {
        assert_eq!(quote("A-Z_a.z~09"), "A-Z_a.z~09");
        assert_eq!(quote("PERIODO PROB. 2 AÑOS"), "PERIODO%20PROB.%202%20A%C3%91OS");
        assert_eq!(quote("A&B=C"), "A%26B%3DC");
    }

    #[test]
    fn update_stamp_is_found_in_markup() {
        let html = "<span>Fecha de actualización de los datos: 05/06/2024 3:07:09 PM</span>";
        assert_eq!(
            extract_update_timestamp(html),
            NaiveDate::from_ymd_opt(2024, 6, 5).unwrap().and_hms_opt(15, 7, 9)
        );
    }

    #[test]
    fn update_stamp_is_found_in_entity_encoded_markup() {
        let html = "<html><body><span>Fecha de actualizaci&oacute;n de los datos:</span> \
                    <b>05/06/2024 10:15:32 AM</b></body></html>";
        assert_eq!(
            extract_update_timestamp(html),
            NaiveDate::from_ymd_opt(2024, 6, 5).unwrap().and_hms_opt(10, 15, 32)
        );
    }

    #[test]
    fn missing_update_stamp_yields_none() {
        assert_eq!(extract_update_timestamp("<html>mantenimiento</html>"), None);
    }

    #[test]
    fn institutions_skip_placeholder_and_blank_lines() {
        let html = r#"<form><select id="MainContent_ddlInstituciones">
            <option value="">-- Seleccione una institución --</option>
            <option>ASAMBLEA NACIONAL</option><option>CAJA DE SEGURO SOCIAL</option>
            <option>MINISTERIO DE SALUD</option>
        </select></form>"#;
        let names: Vec<String> = parse_institutions(html)
            .unwrap()
            .into_iter()
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["ASAMBLEA NACIONAL", "CAJA DE SEGURO SOCIAL", "MINISTERIO DE SALUD"]
        );
    }

    #[test]
    fn missing_select_yields_none() {
        assert!(parse_institutions("<select id=\"other\"></select>").is_none());
    }
}
