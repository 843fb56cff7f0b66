use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The shape a subprocess model's output is expected to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// A CSV document with a header row; columns are typed by content and
    /// non-numeric cells become NaN.
    Csv,
    /// Either an array of row objects, or an object with a `time_series`
    /// array and an optional `kpis` object.
    Json,
}

/// Parse raw simulation output into the standard tabular form plus any KPIs
/// the simulation reported alongside it.
pub fn parse_output(
    format: OutputFormat,
    raw: &[u8],
) -> Result<(Table, BTreeMap<String, f64>), String> {
    match format {
        OutputFormat::Csv => parse_csv(raw).map(|t| (t, BTreeMap::new())),
        OutputFormat::Json => parse_json(raw),
    }
}

fn parse_csv(raw: &[u8]) -> Result<Table, String> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(raw);

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| format!("invalid CSV header: {e}"))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if columns.is_empty() {
        return Err("CSV output has no header row".to_string());
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| format!("invalid CSV record: {e}"))?;
        let row: Vec<f64> = record
            .iter()
            .map(|cell| cell.trim().parse::<f64>().unwrap_or(f64::NAN))
            .collect();
        if row.len() != columns.len() {
            return Err(format!(
                "CSV row has {} fields, expected {}",
                row.len(),
                columns.len()
            ));
        }
        rows.push(row);
    }

    Table::from_rows(columns, rows).map_err(|e| e.to_string())
}

fn parse_json(raw: &[u8]) -> Result<(Table, BTreeMap<String, f64>), String> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| format!("invalid JSON: {e}"))?;

    match value {
        Value::Array(rows) => Ok((rows_to_table(&rows)?, BTreeMap::new())),
        Value::Object(mut object) => {
            let rows = match object.remove("time_series") {
                Some(Value::Array(rows)) => rows,
                Some(_) => return Err("`time_series` is not an array".to_string()),
                None => return Err("JSON object output requires a `time_series` array".to_string()),
            };

            let mut kpis = BTreeMap::new();
            match object.remove("kpis") {
                Some(Value::Object(map)) => {
                    for (name, v) in map {
                        let number = v
                            .as_f64()
                            .ok_or_else(|| format!("KPI `{name}` is not a number"))?;
                        kpis.insert(name, number);
                    }
                }
                Some(Value::Null) | None => {}
                Some(_) => return Err("`kpis` is not an object".to_string()),
            }

            Ok((rows_to_table(&rows)?, kpis))
        }
        _ => Err("JSON output must be an array of rows or an object".to_string()),
    }
}

/// Convert an array of row objects to a table. The column set is the union
/// of keys across rows; absent or non-numeric cells become NaN.
fn rows_to_table(rows: &[Value]) -> Result<Table, String> {
    let mut names = BTreeSet::new();
    for (idx, row) in rows.iter().enumerate() {
        match row {
            Value::Object(map) => names.extend(map.keys().cloned()),
            _ => return Err(format!("row {idx} is not an object")),
        }
    }

    let columns: Vec<String> = names.into_iter().collect();
    if columns.is_empty() && !rows.is_empty() {
        return Err("rows contain no columns".to_string());
    }

    let data = rows
        .iter()
        .map(|row| {
            let map = row.as_object().expect("checked above");
            columns
                .iter()
                .map(|name| map.get(name).and_then(Value::as_f64).unwrap_or(f64::NAN))
                .collect()
        })
        .collect();

    Table::from_rows(columns, data).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn test_parse_csv() {
        let raw = b"t,I,label\n0,10,a\n1,50,b\n2,30,c\n";
        let (table, kpis) = parse_output(OutputFormat::Csv, raw).unwrap();

        assert!(kpis.is_empty());
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.column_names(), &["t", "I", "label"]);
        assert_approx_eq!(f64, table.column("I").unwrap()[1], 50.0);
        // Non-numeric cells parse as NaN.
        assert!(table.column("label").unwrap()[0].is_nan());
    }

    #[test]
    fn test_parse_csv_without_rows() {
        let raw = b"t,I\n";
        let (table, _) = parse_output(OutputFormat::Csv, raw).unwrap();
        assert_eq!(table.num_rows(), 0);
        assert_eq!(table.num_columns(), 2);
    }

    #[test]
    fn test_parse_csv_rejects_garbage() {
        assert!(parse_output(OutputFormat::Csv, b"").is_err());
    }

    #[test]
    fn test_parse_json_row_array() {
        let raw = br#"[{"t": 0, "I": 10.0}, {"t": 1, "I": 50.0}]"#;
        let (table, kpis) = parse_output(OutputFormat::Json, raw).unwrap();

        assert!(kpis.is_empty());
        assert_eq!(table.column_names(), &["I", "t"]);
        assert_approx_eq!(f64, table.column("I").unwrap()[1], 50.0);
    }

    #[test]
    fn test_parse_json_object_with_kpis() {
        let raw = br#"{"time_series": [{"I": 10.0}, {"I": 50.0}], "kpis": {"peak": 50.0}}"#;
        let (table, kpis) = parse_output(OutputFormat::Json, raw).unwrap();

        assert_eq!(table.num_rows(), 2);
        assert_approx_eq!(f64, kpis["peak"], 50.0);
    }

    #[test]
    fn test_parse_json_missing_cells_become_nan() {
        let raw = br#"[{"a": 1.0, "b": 2.0}, {"a": 3.0}]"#;
        let (table, _) = parse_output(OutputFormat::Json, raw).unwrap();
        assert!(table.column("b").unwrap()[1].is_nan());
    }

    #[test]
    fn test_parse_json_rejects_bad_shapes() {
        assert!(parse_output(OutputFormat::Json, b"42").is_err());
        assert!(parse_output(OutputFormat::Json, br#"{"rows": []}"#).is_err());
        assert!(parse_output(OutputFormat::Json, br#"[{"a": 1.0}, 2]"#).is_err());
        assert!(parse_output(OutputFormat::Json, br#"{"time_series": [], "kpis": {"x": "y"}}"#).is_err());
    }
}
