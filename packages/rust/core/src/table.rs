//! Delimited input and output tables.
//!
//! Columns are located by header name (case-insensitive); short rows are
//! padded with empty cells. The output carries every input column plus any
//! configured attribute column the input lacked, a provenance column per
//! attribute, the discovered organisation id, and the record status.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use recordfill_extract::split_address;
use recordfill_shared::{
    ColumnsConfig, FieldKind, PartialRecord, Provenance, RecordfillError, ResolvedRecord, Result,
};

/// Column holding an organisation id found during search.
pub const DISCOVERED_ID_COLUMN: &str = "Discovered Id";

fn table_error(path: &Path, e: csv::Error) -> RecordfillError {
    RecordfillError::Table(format!("{}: {e}", path.display()))
}

fn find_column(headers: &[String], name: &str) -> Option<usize> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name))
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// One data row: the record it describes, its resume hash, and its cells
/// padded to the header width.
#[derive(Debug, Clone)]
pub struct InputRow {
    pub record: PartialRecord,
    pub hash: String,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InputTable {
    pub headers: Vec<String>,
    pub rows: Vec<InputRow>,
}

/// Read the input table at `path`.
pub fn read_input(path: &Path, columns: &ColumnsConfig) -> Result<InputTable> {
    let file = File::open(path).map_err(|e| RecordfillError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| table_error(path, e))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut rows = Vec::new();
    for (index, result) in reader.records().enumerate() {
        let raw = result.map_err(|e| table_error(path, e))?;
        let mut cells: Vec<String> = raw.iter().map(str::to_string).collect();
        cells.resize(headers.len().max(cells.len()), String::new());

        let record = map_record(index, &headers, &cells, columns);
        let hash = find_column(&headers, &columns.hash)
            .and_then(|i| cells.get(i))
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| record.hash());
        rows.push(InputRow {
            record,
            hash,
            cells,
        });
    }

    Ok(InputTable { headers, rows })
}

fn map_record(
    row: usize,
    headers: &[String],
    cells: &[String],
    columns: &ColumnsConfig,
) -> PartialRecord {
    let cell = |name: &str| -> Option<String> {
        find_column(headers, name)
            .and_then(|i| cells.get(i))
            .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|v| !v.is_empty())
    };

    let organization = cell(&columns.organization);
    let person: Vec<String> = [cell(&columns.first_name), cell(&columns.last_name)]
        .into_iter()
        .flatten()
        .collect();
    let name = if person.is_empty() {
        organization.clone().unwrap_or_default()
    } else {
        person.join(" ")
    };

    let mut street = cell(&columns.address);
    let mut number = cell(&columns.number);
    let mut complement = cell(&columns.complement);
    if street.is_none() {
        if let Some(full) = cell(&columns.full_address) {
            let parts = split_address(&full);
            street = Some(parts.street).filter(|s| !s.is_empty());
            number = number.or(parts.number);
            complement = complement.or(parts.complement);
        }
    }

    PartialRecord {
        row,
        name,
        organization,
        identifier: cell(&columns.identifier),
        region: cell(&columns.region)
            .or_else(|| cell(&columns.state))
            .map(|r| r.to_uppercase()),
        street,
        number,
        complement,
        neighborhood: cell(&columns.neighborhood),
        postal_code: cell(&columns.postal_code),
        city: cell(&columns.city),
        phone: cell(&columns.phone),
        mobile: cell(&columns.mobile),
        email: cell(&columns.email),
        category: cell(&columns.category),
    }
}

/// Hashes of rows already present in an earlier output file. A missing file
/// means nothing is done yet.
pub fn read_done_hashes(path: &Path, columns: &ColumnsConfig) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let file = File::open(path).map_err(|e| RecordfillError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| table_error(path, e))?
        .iter()
        .map(str::to_string)
        .collect();
    let Some(index) = find_column(&headers, &columns.hash) else {
        return Ok(HashSet::new());
    };

    let mut done = HashSet::new();
    for result in reader.records() {
        let row = result.map_err(|e| table_error(path, e))?;
        if let Some(hash) = row.get(index).map(str::trim).filter(|h| !h.is_empty()) {
            done.insert(hash.to_string());
        }
    }
    Ok(done)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Where each value goes in an output row.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    headers: Vec<String>,
    input_width: usize,
    hash: usize,
    /// (field, value column, provenance column)
    fields: Vec<(FieldKind, usize, usize)>,
    discovered_id: usize,
    status: usize,
}

impl OutputLayout {
    pub fn new(input_headers: &[String], columns: &ColumnsConfig) -> Self {
        let mut headers = input_headers.to_vec();
        let mut column = |name: &str| -> usize {
            find_column(&headers, name).unwrap_or_else(|| {
                headers.push(name.to_string());
                headers.len() - 1
            })
        };

        let hash = column(&columns.hash);
        let value_columns: Vec<(FieldKind, usize)> = FieldKind::RESOLVABLE
            .into_iter()
            .map(|field| (field, column(field_column(field, columns))))
            .collect();
        let fields = value_columns
            .into_iter()
            .map(|(field, value)| {
                let source = column(&format!("{} Source", field_column(field, columns)));
                (field, value, source)
            })
            .collect();
        let discovered_id = column(DISCOVERED_ID_COLUMN);
        let status = column(&columns.status);

        Self {
            headers,
            input_width: input_headers.len(),
            hash,
            fields,
            discovered_id,
            status,
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Output cells for one finished record. Unresolved attributes are
    /// written empty even when the input cell held a rejected value, except
    /// the street: the cascade searched with it, so it is written back as
    /// given.
    pub fn row(&self, resolved: &ResolvedRecord, input: &InputRow) -> Vec<String> {
        let mut cells = input.cells.clone();
        cells.truncate(self.input_width);
        cells.resize(self.headers.len(), String::new());

        cells[self.hash] = input.hash.clone();
        for &(field, value_col, source_col) in &self.fields {
            let (value, source) = match resolved.get(field) {
                Some(r) if field == FieldKind::Address => {
                    (split_address(&r.value).street, r.provenance.as_str())
                }
                Some(r) => (r.value.clone(), r.provenance.as_str()),
                None if field == FieldKind::Address => input
                    .record
                    .known(FieldKind::Address)
                    .map(|street| (street.to_string(), Provenance::Input.as_str()))
                    .unwrap_or_default(),
                None => (String::new(), ""),
            };
            cells[value_col] = value;
            cells[source_col] = source.to_string();
        }
        cells[self.discovered_id] = resolved.discovered_id.clone().unwrap_or_default();
        cells[self.status] = resolved.status.as_str().to_string();
        cells
    }
}

fn field_column(field: FieldKind, columns: &ColumnsConfig) -> &str {
    match field {
        FieldKind::Address => &columns.address,
        FieldKind::Number => &columns.number,
        FieldKind::Complement => &columns.complement,
        FieldKind::Neighborhood => &columns.neighborhood,
        FieldKind::PostalCode => &columns.postal_code,
        FieldKind::City => &columns.city,
        FieldKind::Region => &columns.state,
        FieldKind::Phone => &columns.phone,
        FieldKind::Mobile => &columns.mobile,
        FieldKind::Email => &columns.email,
        FieldKind::Category => &columns.category,
        FieldKind::OrgId => DISCOVERED_ID_COLUMN,
    }
}

/// Appends output rows, flushing to disk every `every` rows.
///
/// An existing non-empty file is appended to without a second header.
pub struct CheckpointWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    every: usize,
    pending: usize,
    written: usize,
}

impl CheckpointWriter {
    pub fn open(path: &Path, layout: &OutputLayout, every: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| RecordfillError::io(parent, e))?;
        }
        let resuming = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| RecordfillError::io(path, e))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if !resuming {
            writer
                .write_record(layout.headers())
                .map_err(|e| table_error(path, e))?;
            writer.flush().map_err(|e| RecordfillError::io(path, e))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            every: every.max(1),
            pending: 0,
            written: 0,
        })
    }

    /// Queue a row. Returns `true` when this call flushed a checkpoint.
    pub fn write(&mut self, cells: &[String]) -> Result<bool> {
        self.writer
            .write_record(cells)
            .map_err(|e| table_error(&self.path, e))?;
        self.pending += 1;
        self.written += 1;
        if self.pending >= self.every {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| RecordfillError::io(&self.path, e))?;
        self.pending = 0;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordfill_shared::RecordStatus;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("recordfill-{name}-{}.csv", uuid::Uuid::now_v7()))
    }

    const INPUT: &str = "\
Firstname,LastName,CRM,UF,Endereco Completo A1,City A1,E-mail A1
Jane,Doe,123456,sp,\"Rua Augusta, 1500 - Sala 12\",São Paulo,not-an-email
John,,,RJ
";

    #[test]
    fn maps_headers_pads_short_rows_and_splits_full_address() {
        let path = temp_path("input");
        std::fs::write(&path, INPUT).unwrap();
        let table = read_input(&path, &ColumnsConfig::default()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(table.rows.len(), 2);
        let jane = &table.rows[0].record;
        assert_eq!(jane.name, "Jane Doe");
        assert_eq!(jane.identifier.as_deref(), Some("123456"));
        assert_eq!(jane.region.as_deref(), Some("SP"));
        assert_eq!(jane.street.as_deref(), Some("Rua Augusta"));
        assert_eq!(jane.number.as_deref(), Some("1500"));
        assert_eq!(jane.complement.as_deref(), Some("Sala 12"));
        assert_eq!(table.rows[0].hash, jane.hash());

        let john = &table.rows[1];
        assert_eq!(john.record.name, "John");
        assert_eq!(john.record.row, 1);
        assert_eq!(john.record.city, None);
        assert_eq!(john.cells.len(), table.headers.len());
    }

    #[test]
    fn output_appends_columns_and_blanks_unresolved_values() {
        let path = temp_path("layout");
        std::fs::write(&path, INPUT).unwrap();
        let columns = ColumnsConfig::default();
        let table = read_input(&path, &columns).unwrap();
        std::fs::remove_file(&path).ok();

        let layout = OutputLayout::new(&table.headers, &columns);
        let headers = layout.headers();
        assert_eq!(&headers[..7], &table.headers[..]);
        assert!(headers.contains(&"postal code A1 Source".to_string()));
        assert_eq!(headers.last().map(String::as_str), Some("STATUS"));

        let input = &table.rows[0];
        let mut resolved = ResolvedRecord::new(input.record.clone());
        resolved.set(FieldKind::Address, "Rua Augusta, 1500", Provenance::Page);
        resolved.set(FieldKind::PostalCode, "01305-100", Provenance::StructuredApi);
        resolved.finalize(&[FieldKind::Address, FieldKind::PostalCode]);

        let cells = layout.row(&resolved, input);
        let at = |name: &str| cells[headers.iter().position(|h| h == name).unwrap()].as_str();
        assert_eq!(at("Address A1"), "Rua Augusta");
        assert_eq!(at("Address A1 Source"), "page");
        assert_eq!(at("postal code A1"), "01305-100");
        assert_eq!(at("postal code A1 Source"), "structured-api");
        assert_eq!(at("E-mail A1"), "");
        assert_eq!(at("Hash"), input.hash);
        assert_eq!(at("STATUS"), RecordStatus::Complete.as_str());
    }

    #[test]
    fn unvalidated_input_street_is_written_back() {
        let path = temp_path("street");
        let csv = "\
Firstname,LastName,UF,Address A1,City A1
Jane,Doe,SP,Rua X,São Paulo
John,Roe,SP,,São Paulo
";
        std::fs::write(&path, csv).unwrap();
        let columns = ColumnsConfig::default();
        let table = read_input(&path, &columns).unwrap();
        std::fs::remove_file(&path).ok();

        let layout = OutputLayout::new(&table.headers, &columns);
        let headers = layout.headers();
        let column = |name: &str| headers.iter().position(|h| h == name).unwrap();

        // Too short for the address validator, so never seeded as resolved.
        let jane = &table.rows[0];
        let cells = layout.row(&ResolvedRecord::new(jane.record.clone()), jane);
        assert_eq!(cells[column("Address A1")], "Rua X");
        assert_eq!(cells[column("Address A1 Source")], "input");

        let john = &table.rows[1];
        let cells = layout.row(&ResolvedRecord::new(john.record.clone()), john);
        assert_eq!(cells[column("Address A1")], "");
        assert_eq!(cells[column("Address A1 Source")], "");
    }

    #[test]
    fn checkpoint_resume_skips_written_hashes() {
        let input_path = temp_path("resume-in");
        let output_path = temp_path("resume-out");
        std::fs::write(&input_path, INPUT).unwrap();
        let columns = ColumnsConfig::default();
        let table = read_input(&input_path, &columns).unwrap();
        let layout = OutputLayout::new(&table.headers, &columns);

        {
            let mut writer = CheckpointWriter::open(&output_path, &layout, 10).unwrap();
            let first = &table.rows[0];
            let resolved = ResolvedRecord::new(first.record.clone());
            assert!(!writer.write(&layout.row(&resolved, first)).unwrap());
            writer.flush().unwrap();
        }
        let done = read_done_hashes(&output_path, &columns).unwrap();
        assert!(done.contains(&table.rows[0].hash));
        assert!(!done.contains(&table.rows[1].hash));

        {
            let mut writer = CheckpointWriter::open(&output_path, &layout, 1).unwrap();
            let second = &table.rows[1];
            let resolved = ResolvedRecord::new(second.record.clone());
            assert!(writer.write(&layout.row(&resolved, second)).unwrap());
        }
        let written = std::fs::read_to_string(&output_path).unwrap();
        assert_eq!(written.matches("Firstname").count(), 1);
        assert_eq!(read_done_hashes(&output_path, &columns).unwrap().len(), 2);

        std::fs::remove_file(&input_path).ok();
        std::fs::remove_file(&output_path).ok();
        assert!(read_done_hashes(&output_path, &columns).unwrap().is_empty());
    }
}
