use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column headers of the quote spreadsheet, in row order.
pub const QUOTE_HEADERS: [&str; 8] = [
    "ID", "Date", "Customer", "Email", "Phone", "Total", "Status", "Notes",
];

/// Format of the date column.
pub const QUOTE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// One quote as handed to the spreadsheet update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total: f64,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub notes: String,
}

fn default_status() -> String {
    "pending".to_string()
}

impl QuoteRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            total: 0.0,
            status: default_status(),
            notes: String::new(),
        }
    }

    /// The fixed 8-column row written for this quote.
    pub fn row(&self, customer: &CustomerInfo) -> QuoteRow {
        QuoteRow {
            id: self.id.clone(),
            date: self
                .created_at
                .map(|at| at.format(QUOTE_DATE_FORMAT).to_string())
                .unwrap_or_default(),
            customer: customer.name.clone(),
            email: customer.email.clone(),
            phone: customer.phone.clone(),
            total: self.total,
            status: self.status.clone(),
            notes: self.notes.clone(),
        }
    }
}

/// Customer fields copied into a quote row. Missing fields become empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

/// One spreadsheet line: `[ID, Date, Customer, Email, Phone, Total, Status, Notes]`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteRow {
    pub id: String,
    pub date: String,
    pub customer: String,
    pub email: String,
    pub phone: String,
    pub total: f64,
    pub status: String,
    pub notes: String,
}
