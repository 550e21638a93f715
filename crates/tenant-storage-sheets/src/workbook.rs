use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::Value;

use crate::error::SheetError;
use crate::xlsx::Package;

/// Value held by one cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// JSON view used by record reads.
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Empty => Value::Null,
            CellValue::Text(s) => Value::String(s.clone()),
            CellValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Bool(b) => Value::Bool(*b),
        }
    }

    /// Cell value from JSON. Arrays and objects are stored as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => CellValue::Empty,
            Value::Bool(b) => CellValue::Bool(*b),
            Value::Number(n) => n.as_f64().map(CellValue::Number).unwrap_or(CellValue::Empty),
            Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        CellValue::Number(n as f64)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

/// Formula of a cell. The cell's value is its cached result.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub text: String,
    /// Attributes of the `<f>` element, such as `t`, `ref` and `si` of shared formulas.
    pub attributes: Vec<(String, String)>,
}

impl Formula {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attributes: Vec::new(),
        }
    }
}

/// A1-style cell reference. Rows and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellAddress {
    pub row: u32,
    pub col: u32,
}

impl CellAddress {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Parse `"B3"`, `"aa10"` or `"$C$4"`.
    pub fn parse(address: &str) -> Result<Self, SheetError> {
        let invalid = || SheetError::InvalidAddress(address.to_string());
        let cleaned: String = address.chars().filter(|c| *c != '$').collect();
        let split = cleaned
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (letters, digits) = cleaned.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid());
        }

        let mut col: u32 = 0;
        for c in letters.chars() {
            let value = c.to_ascii_uppercase() as u32 - 'A' as u32 + 1;
            col = col
                .checked_mul(26)
                .and_then(|v| v.checked_add(value))
                .ok_or_else(invalid)?;
        }
        let row: u32 = digits.parse().map_err(|_| invalid())?;
        if row == 0 {
            return Err(invalid());
        }
        Ok(Self { row, col })
    }

    /// Column letters for a 1-based index (`1` → `A`, `27` → `AA`).
    pub fn column_letters(mut col: u32) -> String {
        let mut letters = Vec::new();
        while col > 0 {
            let rem = ((col - 1) % 26) as u8;
            letters.push((b'A' + rem) as char);
            col = (col - 1) / 26;
        }
        letters.iter().rev().collect()
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::column_letters(self.col), self.row)
    }
}

/// One sheet of a workbook. Storage is sparse: only non-empty cells are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct Worksheet {
    pub name: String,
    pub rows: BTreeMap<u32, BTreeMap<u32, CellValue>>,
    /// Rows rendered with the header style.
    pub header_style_rows: BTreeSet<u32>,
    /// Stylesheet index of each cell as read, keyed by `(row, col)`.
    pub cell_styles: BTreeMap<(u32, u32), u32>,
    pub formulas: BTreeMap<(u32, u32), Formula>,
    /// Row attributes carried through a read/write cycle (`ht`, `hidden`, `s`, ...).
    pub row_attributes: BTreeMap<u32, Vec<(String, String)>>,
    /// Package part this sheet was read from.
    pub(crate) part: Option<String>,
}

impl Worksheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: BTreeMap::new(),
            header_style_rows: BTreeSet::new(),
            cell_styles: BTreeMap::new(),
            formulas: BTreeMap::new(),
            row_attributes: BTreeMap::new(),
            part: None,
        }
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&CellValue> {
        self.rows.get(&row).and_then(|cells| cells.get(&col))
    }

    pub fn formula(&self, row: u32, col: u32) -> Option<&Formula> {
        self.formulas.get(&(row, col))
    }

    pub fn style(&self, row: u32, col: u32) -> Option<u32> {
        self.cell_styles.get(&(row, col)).copied()
    }

    /// Set a cell. Writing an empty value clears it. Either way the cell's
    /// formula is dropped and its style kept.
    pub fn set(&mut self, row: u32, col: u32, value: impl Into<CellValue>) {
        self.formulas.remove(&(row, col));
        self.put(row, col, value.into());
    }

    /// Set a formula together with its cached result.
    pub fn set_formula(&mut self, row: u32, col: u32, formula: Formula, cached: impl Into<CellValue>) {
        self.put(row, col, cached.into());
        self.formulas.insert((row, col), formula);
    }

    fn put(&mut self, row: u32, col: u32, value: CellValue) {
        if value == CellValue::Empty {
            if let Some(cells) = self.rows.get_mut(&row) {
                cells.remove(&col);
                if cells.is_empty() {
                    self.rows.remove(&row);
                }
            }
            return;
        }
        self.rows.entry(row).or_default().insert(col, value);
    }

    pub fn set_address(&mut self, address: &str, value: impl Into<CellValue>) -> Result<(), SheetError> {
        let at = CellAddress::parse(address)?;
        self.set(at.row, at.col, value);
        Ok(())
    }

    /// Last row holding a value, 0 for an empty sheet.
    pub fn max_row(&self) -> u32 {
        self.rows.keys().next_back().copied().unwrap_or(0)
    }

    /// Last column holding a value in any row, 0 for an empty sheet.
    pub fn max_column(&self) -> u32 {
        self.rows
            .values()
            .filter_map(|cells| cells.keys().next_back().copied())
            .max()
            .unwrap_or(0)
    }

    /// Write `values` from column 1 of the row after the last used one.
    /// Returns the row index written.
    pub fn append_row<I, V>(&mut self, values: I) -> u32
    where
        I: IntoIterator<Item = V>,
        V: Into<CellValue>,
    {
        let row = self.max_row().saturating_add(1);
        self.write_row(row, values);
        row
    }

    /// Overwrite a row starting at column 1.
    pub fn write_row<I, V>(&mut self, row: u32, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<CellValue>,
    {
        for (idx, value) in values.into_iter().enumerate() {
            self.set(row, idx as u32 + 1, value);
        }
    }

    /// Dense values of `row` from column 1 through `width`.
    pub fn row_values(&self, row: u32, width: u32) -> Vec<CellValue> {
        (1..=width)
            .map(|col| self.cell(row, col).cloned().unwrap_or_default())
            .collect()
    }

    /// First row at or after `from` whose cell in `col` displays as `needle`.
    pub fn find_in_column(&self, col: u32, from: u32, needle: &str) -> Option<u32> {
        self.rows
            .range(from..)
            .find(|(_, cells)| {
                cells
                    .get(&col)
                    .is_some_and(|v| !v.is_empty() && v.to_string() == needle)
            })
            .map(|(row, _)| *row)
    }

    pub fn style_header_row(&mut self, row: u32) {
        self.header_style_rows.insert(row);
    }
}

/// An ordered set of worksheets with one active sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<Worksheet>,
    pub active: usize,
    /// Parts of the document this workbook was decoded from.
    pub(crate) package: Option<Package>,
}

impl Workbook {
    /// New workbook with a single empty sheet.
    pub fn new(first_sheet: impl Into<String>) -> Self {
        Self {
            sheets: vec![Worksheet::new(first_sheet)],
            active: 0,
            package: None,
        }
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn sheet(&self, name: &str) -> Option<&Worksheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_mut(&mut self, name: &str) -> Option<&mut Worksheet> {
        self.sheets.iter_mut().find(|s| s.name == name)
    }

    /// Existing sheet by name, or a new one appended to the workbook.
    pub fn sheet_or_create(&mut self, name: &str) -> &mut Worksheet {
        let idx = match self.sheets.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sheets.push(Worksheet::new(name));
                self.sheets.len() - 1
            }
        };
        &mut self.sheets[idx]
    }

    pub fn active_sheet(&self) -> Option<&Worksheet> {
        self.sheets.get(self.active)
    }

    pub fn active_sheet_mut(&mut self) -> Option<&mut Worksheet> {
        self.sheets.get_mut(self.active)
    }

    /// Make `name` the active sheet. Returns false when there is no such sheet.
    pub fn set_active(&mut self, name: &str) -> bool {
        match self.sheets.iter().position(|s| s.name == name) {
            Some(idx) => {
                self.active = idx;
                true
            }
            None => false,
        }
    }
}
