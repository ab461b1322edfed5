//! Parquet snapshots: one immutable file per successfully normalized work item.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow_array::{
    Array, Date32Array, Float64Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use planilla_core::{EmploymentStatus, NormalizedRecord, NormalizedReport, WorkItem};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{sha256_hex, temp_path_for, write_temp_file};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRef {
    pub file_name: String,
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

pub fn snapshot_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("cedula", DataType::Utf8, false),
        ArrowField::new("nombre", DataType::Utf8, false),
        ArrowField::new("apellido", DataType::Utf8, true),
        ArrowField::new("cargo", DataType::Utf8, false),
        ArrowField::new("salario", DataType::Float64, false),
        ArrowField::new("gasto", DataType::Float64, false),
        ArrowField::new("estado", DataType::Utf8, false),
        ArrowField::new("fecha_de_inicio", DataType::Date32, true),
        ArrowField::new(
            "fecha_actualizacion",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
        ArrowField::new(
            "fecha_consulta",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        ArrowField::new("archivo", DataType::Utf8, false),
        ArrowField::new("institucion", DataType::Utf8, false),
    ]))
}

fn epoch_date() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

fn sanitize_file_component(input: &str) -> String {
    let cleaned: String = input
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "reporte".to_string()
    } else {
        cleaned
    }
}

/// `<archivo>_<status>_<epoch seconds>_<microseconds>`, without extension.
pub fn snapshot_file_stem(
    archivo: &str,
    status: EmploymentStatus,
    queried_at: DateTime<Utc>,
) -> String {
    format!(
        "{}_{}_{}_{:06}",
        sanitize_file_component(archivo),
        status.label(),
        queried_at.timestamp(),
        queried_at.timestamp_subsec_micros()
    )
}

pub fn encode_snapshot(records: &[NormalizedRecord]) -> Result<Vec<u8>> {
    let schema = snapshot_schema();
    let epoch = epoch_date();

    let cedulas = StringArray::from(records.iter().map(|r| r.cedula.as_str()).collect::<Vec<_>>());
    let nombres = StringArray::from(records.iter().map(|r| r.nombre.as_str()).collect::<Vec<_>>());
    let apellidos = StringArray::from(
        records
            .iter()
            .map(|r| r.apellido.as_deref())
            .collect::<Vec<_>>(),
    );
    let cargos = StringArray::from(records.iter().map(|r| r.cargo.as_str()).collect::<Vec<_>>());
    let salarios = Float64Array::from(records.iter().map(|r| r.salario).collect::<Vec<_>>());
    let gastos = Float64Array::from(records.iter().map(|r| r.gasto).collect::<Vec<_>>());
    let estados = StringArray::from(records.iter().map(|r| r.estado.as_str()).collect::<Vec<_>>());
    let inicios = Date32Array::from(
        records
            .iter()
            .map(|r| {
                r.fecha_de_inicio
                    .map(|d| (d - epoch).num_days())
                    .map(i32::try_from)
                    .transpose()
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("start date outside Date32 range")?,
    );
    let actualizaciones = TimestampMicrosecondArray::from(
        records
            .iter()
            .map(|r| r.fecha_actualizacion.and_utc().timestamp_micros())
            .collect::<Vec<_>>(),
    );
    let consultas = TimestampMicrosecondArray::from(
        records
            .iter()
            .map(|r| r.fecha_consulta.timestamp_micros())
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let archivos = StringArray::from(records.iter().map(|r| r.archivo.as_str()).collect::<Vec<_>>());
    let instituciones = StringArray::from(
        records
            .iter()
            .map(|r| r.institucion.as_str())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(cedulas),
            Arc::new(nombres),
            Arc::new(apellidos),
            Arc::new(cargos),
            Arc::new(salarios),
            Arc::new(gastos),
            Arc::new(estados),
            Arc::new(inicios),
            Arc::new(actualizaciones),
            Arc::new(consultas),
            Arc::new(archivos),
            Arc::new(instituciones),
        ],
    )
    .context("building snapshot record batch")?;

    let mut writer =
        ArrowWriter::try_new(Vec::new(), schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing snapshot record batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .with_context(|| format!("snapshot is missing column {name}"))?
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("snapshot column {name} has an unexpected type"))
}

fn opt_str(array: &StringArray, row: usize) -> Option<String> {
    (!array.is_null(row)).then(|| array.value(row).to_string())
}

/// Decode a snapshot back into records.
pub fn read_snapshot(path: &Path) -> Result<Vec<NormalizedRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?
        .build()
        .with_context(|| format!("building parquet reader {}", path.display()))?;

    let epoch = epoch_date();
    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("decoding {}", path.display()))?;
        let cedulas = column::<StringArray>(&batch, "cedula")?;
        let nombres = column::<StringArray>(&batch, "nombre")?;
        let apellidos = column::<StringArray>(&batch, "apellido")?;
        let cargos = column::<StringArray>(&batch, "cargo")?;
        let salarios = column::<Float64Array>(&batch, "salario")?;
        let gastos = column::<Float64Array>(&batch, "gasto")?;
        let estados = column::<StringArray>(&batch, "estado")?;
        let inicios = column::<Date32Array>(&batch, "fecha_de_inicio")?;
        let actualizaciones = column::<TimestampMicrosecondArray>(&batch, "fecha_actualizacion")?;
        let consultas = column::<TimestampMicrosecondArray>(&batch, "fecha_consulta")?;
        let archivos = column::<StringArray>(&batch, "archivo")?;
        let instituciones = column::<StringArray>(&batch, "institucion")?;

        for row in 0..batch.num_rows() {
            let fecha_de_inicio = if inicios.is_null(row) {
                None
            } else {
                Some(epoch + chrono::Duration::days(i64::from(inicios.value(row))))
            };
            let fecha_actualizacion = DateTime::from_timestamp_micros(actualizaciones.value(row))
                .ok_or_else(|| anyhow!("fecha_actualizacion out of range at row {row}"))?
                .naive_utc();
            let fecha_consulta = DateTime::from_timestamp_micros(consultas.value(row))
                .ok_or_else(|| anyhow!("fecha_consulta out of range at row {row}"))?;

            records.push(NormalizedRecord {
                cedula: cedulas.value(row).to_string(),
                nombre: nombres.value(row).to_string(),
                apellido: opt_str(apellidos, row),
                cargo: cargos.value(row).to_string(),
                salario: salarios.value(row),
                gasto: gastos.value(row),
                estado: estados.value(row).to_string(),
                fecha_de_inicio,
                fecha_actualizacion,
                fecha_consulta,
                archivo: archivos.value(row).to_string(),
                institucion: instituciones.value(row).to_string(),
            });
        }
    }
    Ok(records)
}

/// Publishes snapshots into the staging directory.
///
/// Each snapshot is encoded in memory, written to a hidden temp file and
/// renamed into place, so downstream readers only ever see complete files.
/// An existing snapshot is never replaced.
#[derive(Debug)]
pub struct SnapshotWriter {
    staging_dir: PathBuf,
    publish: Mutex<()>,
}

impl SnapshotWriter {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            publish: Mutex::new(()),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub async fn write(&self, item: &WorkItem, report: &NormalizedReport) -> Result<SnapshotRef> {
        fs::create_dir_all(&self.staging_dir)
            .await
            .with_context(|| format!("creating staging directory {}", self.staging_dir.display()))?;

        let bytes = encode_snapshot(&report.records)
            .with_context(|| format!("encoding snapshot for {item}"))?;
        let sha256 = sha256_hex(&bytes);

        let temp_path = temp_path_for(&self.staging_dir, bytes.len());
        if let Err(err) = write_temp_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        let stem = snapshot_file_stem(&report.archivo, item.status, report.fecha_consulta);
        let published = self.publish_unique(&temp_path, &stem).await;
        let (file_name, path) = match published {
            Ok(found) => found,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        debug!(file = %file_name, rows = report.records.len(), "snapshot published");
        Ok(SnapshotRef {
            file_name,
            path,
            rows: report.records.len(),
            bytes: bytes.len() as u64,
            sha256,
        })
    }

    async fn publish_unique(&self, temp_path: &Path, stem: &str) -> Result<(String, PathBuf)> {
        let _guard = self.publish.lock().await;
        let mut suffix = 0usize;
        loop {
            let file_name = if suffix == 0 {
                format!("{stem}.parquet")
            } else {
                format!("{stem}_{suffix}.parquet")
            };
            let path = self.staging_dir.join(&file_name);
            let taken = fs::try_exists(&path)
                .await
                .with_context(|| format!("checking snapshot path {}", path.display()))?;
            if !taken {
                fs::rename(temp_path, &path).await.with_context(|| {
                    format!(
                        "atomically renaming {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })?;
                return Ok((file_name, path));
            }
            suffix += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use planilla_core::Institution;
    use tempfile::tempdir;

    fn queried_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 7, 14, 30, 5).single().unwrap()
            + chrono::Duration::microseconds(123_456)
    }

    fn record(cedula: &str, salario: f64, inicio: Option<NaiveDate>) -> NormalizedRecord {
        NormalizedRecord {
            cedula: cedula.to_string(),
            nombre: "ANA".to_string(),
            apellido: Some("PÉREZ".to_string()),
            cargo: "ANALISTA".to_string(),
            salario,
            gasto: 12.345_678_9,
            estado: "PERMANENTE".to_string(),
            fecha_de_inicio: inicio,
            fecha_actualizacion: NaiveDate::from_ymd_opt(2024, 6, 5)
                .unwrap()
                .and_hms_opt(22, 15, 32)
                .unwrap(),
            fecha_consulta: queried_at(),
            archivo: "Planilla_MINSA".to_string(),
            institucion: "MINISTERIO DE SALUD".to_string(),
        }
    }

    fn report(records: Vec<NormalizedRecord>) -> NormalizedReport {
        NormalizedReport {
            archivo: "Planilla_MINSA".to_string(),
            fecha_consulta: queried_at(),
            fecha_actualizacion: NaiveDate::from_ymd_opt(2024, 6, 5)
                .unwrap()
                .and_hms_opt(22, 15, 32)
                .unwrap(),
            records,
        }
    }

    fn item() -> WorkItem {
        WorkItem::new(
            Institution::new("MINISTERIO DE SALUD"),
            EmploymentStatus::Permanente,
        )
    }

    #[test]
    fn file_stem_flattens_fractional_seconds() {
        let stem = snapshot_file_stem("Planilla/MINSA", EmploymentStatus::PorAsignar, queried_at());
        assert_eq!(stem, "Planilla_MINSA_POR ASIGNAR_1717770605_123456");
    }

    #[tokio::test]
    async fn snapshot_round_trips_typed_values() {
        let dir = tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("staging"));
        let records = vec![
            record("8-123-456", 1_234.56, NaiveDate::from_ymd_opt(2019, 1, 31)),
            record("PE-1-22", 0.1 + 0.2, None),
            record("E-8-9", 2_500.0, NaiveDate::from_ymd_opt(1965, 12, 1)),
        ];

        let snapshot = writer.write(&item(), &report(records.clone())).await.unwrap();
        assert_eq!(snapshot.rows, 3);
        assert_eq!(
            snapshot.file_name,
            "Planilla_MINSA_PERMANENTE_1717770605_123456.parquet"
        );
        assert_eq!(snapshot.sha256, sha256_hex(&std::fs::read(&snapshot.path).unwrap()));

        let decoded = read_snapshot(&snapshot.path).unwrap();
        assert_eq!(decoded, records);
    }

    #[tokio::test]
    async fn empty_report_still_produces_a_snapshot() {
        let dir = tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path());
        let snapshot = writer.write(&item(), &report(Vec::new())).await.unwrap();
        assert_eq!(snapshot.rows, 0);
        assert!(read_snapshot(&snapshot.path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn colliding_names_get_a_suffix_instead_of_overwriting() {
        let dir = tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path());
        let first = writer
            .write(&item(), &report(vec![record("1", 1.0, None)]))
            .await
            .unwrap();
        let second = writer
            .write(&item(), &report(vec![record("2", 2.0, None)]))
            .await
            .unwrap();

        assert_ne!(first.path, second.path);
        assert!(second.file_name.ends_with("_123456_1.parquet"));
        assert_eq!(read_snapshot(&first.path).unwrap()[0].cedula, "1");
        assert_eq!(read_snapshot(&second.path).unwrap()[0].cedula, "2");

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.ends_with(".parquet")));
    }
}
