//! Core domain model for the planilla harvester.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "planilla-core";

/// On-disk format of the persisted update checkpoint.
pub const CHECKPOINT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A payroll-reporting entity as named by the portal's selection form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Institution(String);

impl Institution {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Institution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Institution {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Contract/tenure categories accepted by the report endpoint.
///
/// The portal does not publish this list through the institution form, so the
/// labels are fixed here and must match the report filter values exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EmploymentStatus {
    #[serde(rename = "EVENTUAL")]
    Eventual,
    #[serde(rename = "INTERINO ABIERTO")]
    InterinoAbierto,
    #[serde(rename = "INTERINO HASTA FIN DE AÑO")]
    InterinoHastaFinDeAno,
    #[serde(rename = "PERIODO PROB. 2 AÑOS")]
    PeriodoProbatorioDosAnos,
    #[serde(rename = "PERIODO PROB. DE 1 AÑO")]
    PeriodoProbatorioUnAno,
    #[serde(rename = "PERMANENTE")]
    Permanente,
    #[serde(rename = "POR ASIGNAR")]
    PorAsignar,
}

impl EmploymentStatus {
    pub const ALL: [EmploymentStatus; 7] = [
        EmploymentStatus::Eventual,
        EmploymentStatus::InterinoAbierto,
        EmploymentStatus::InterinoHastaFinDeAno,
        EmploymentStatus::PeriodoProbatorioDosAnos,
        EmploymentStatus::PeriodoProbatorioUnAno,
        EmploymentStatus::Permanente,
        EmploymentStatus::PorAsignar,
    ];

    /// Label as sent in the `E=` report filter.
    pub fn label(self) -> &'static str {
        match self {
            EmploymentStatus::Eventual => "EVENTUAL",
            EmploymentStatus::InterinoAbierto => "INTERINO ABIERTO",
            EmploymentStatus::InterinoHastaFinDeAno => "INTERINO HASTA FIN DE AÑO",
            EmploymentStatus::PeriodoProbatorioDosAnos => "PERIODO PROB. 2 AÑOS",
            EmploymentStatus::PeriodoProbatorioUnAno => "PERIODO PROB. DE 1 AÑO",
            EmploymentStatus::Permanente => "PERMANENTE",
            EmploymentStatus::PorAsignar => "POR ASIGNAR",
        }
    }
}

impl fmt::Display for EmploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One unit of fetch/retry work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub institution: Institution,
    pub status: EmploymentStatus,
}

impl WorkItem {
    pub fn new(institution: Institution, status: EmploymentStatus) -> Self {
        Self {
            institution,
            status,
        }
    }

    /// Institution-major cartesian product; repeated pairs are dropped.
    pub fn cartesian<'a>(
        institutions: impl IntoIterator<Item = &'a Institution>,
        statuses: &[EmploymentStatus],
    ) -> Vec<WorkItem> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for institution in institutions {
            for status in statuses {
                let item = WorkItem::new(institution.clone(), *status);
                if seen.insert(item.clone()) {
                    items.push(item);
                }
            }
        }
        items
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.institution, self.status)
    }
}

/// One payroll line of a normalized report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub cedula: String,
    pub nombre: String,
    pub apellido: Option<String>,
    pub cargo: String,
    pub salario: f64,
    pub gasto: f64,
    pub estado: String,
    pub fecha_de_inicio: Option<NaiveDate>,
    /// "Updated as of" stamp printed on the source report (portal wall clock).
    pub fecha_actualizacion: NaiveDateTime,
    /// When this run queried the report.
    pub fecha_consulta: DateTime<Utc>,
    pub archivo: String,
    pub institucion: String,
}

/// Normalized contents of one downloaded report, with the per-download
/// metadata needed to name its snapshot even when it has no rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReport {
    pub archivo: String,
    pub fecha_consulta: DateTime<Utc>,
    pub fecha_actualizacion: NaiveDateTime,
    pub records: Vec<NormalizedRecord>,
}

/// Parse the portal's `DD/MM/YYYY hh:mm:ss AM|PM` stamp.
///
/// The meridiem is honoured as a 12-hour clock; hours above 12 are taken as
/// already being on a 24-hour clock.
pub fn parse_portal_timestamp(text: &str) -> Option<NaiveDateTime> {
    let mut parts = text.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?;
    let meridiem = parts.next();
    if parts.next().is_some() {
        return None;
    }

    let date = NaiveDate::parse_from_str(date, "%d/%m/%Y").ok()?;
    let mut hms = time.split(':').map(|p| p.parse::<u32>().ok());
    let (hour, minute, second) = (hms.next()??, hms.next()??, hms.next()??);
    if hms.next().is_some() {
        return None;
    }

    let hour = match meridiem.map(str::to_ascii_uppercase).as_deref() {
        None => hour,
        Some("AM") if hour == 12 => 0,
        Some("AM") => hour,
        Some("PM") if hour < 12 => hour + 12,
        Some("PM") => hour,
        Some(_) => return None,
    };
    date.and_hms_opt(hour, minute, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn portal_timestamp_honours_meridiem() {
        assert_eq!(
            parse_portal_timestamp("05/06/2024 10:15:32 AM"),
            Some(ts(2024, 6, 5, 10, 15, 32))
        );
        assert_eq!(
            parse_portal_timestamp("05/06/2024 3:07:09 PM"),
            Some(ts(2024, 6, 5, 15, 7, 9))
        );
        assert_eq!(
            parse_portal_timestamp("5/6/2024 12:00:00 AM"),
            Some(ts(2024, 6, 5, 0, 0, 0))
        );
        assert_eq!(
            parse_portal_timestamp("05/06/2024 12:30:00 pm"),
            Some(ts(2024, 6, 5, 12, 30, 0))
        );
        assert_eq!(
            parse_portal_timestamp("05/06/2024 13:30:00 PM"),
            Some(ts(2024, 6, 5, 13, 30, 0))
        );
    }

    #[test]
    fn portal_timestamp_rejects_garbage() {
        assert_eq!(parse_portal_timestamp(""), None);
        assert_eq!(parse_portal_timestamp("31/02/2024 10:00:00 AM"), None);
        assert_eq!(parse_portal_timestamp("05/06/2024 10:00 AM"), None);
        assert_eq!(parse_portal_timestamp("05/06/2024 10:00:00 XM"), None);
    }

    #[test]
    fn cartesian_is_institution_major_and_unique() {
        let a = Institution::new("MINISTERIO DE SALUD");
        let b = Institution::new("CAJA DE AHORROS");
        let items = WorkItem::cartesian([&a, &b, &a], &EmploymentStatus::ALL);
        assert_eq!(items.len(), 14);
        assert_eq!(items[0], WorkItem::new(a.clone(), EmploymentStatus::Eventual));
        assert_eq!(items[7], WorkItem::new(b, EmploymentStatus::Eventual));
    }

    #[test]
    fn status_serializes_as_portal_label() {
        for status in EmploymentStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.label()));
        }
    }
}
