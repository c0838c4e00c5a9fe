//! Structured run report.
//!
//! Stages add pages describing what they did; rendering is left to the
//! caller. The report serialises to JSON.

use serde::Serialize;

use crate::error::{PipelineError, Result};

/// One element of a report page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportBlock {
    Heading { text: String, level: u8 },
    Text { text: String },
    Matrix { rows: [[f64; 4]; 4] },
    Image { name: String },
}

/// A page of a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportPage {
    blocks: Vec<ReportBlock>,
}

impl ReportPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heading(&mut self, text: impl Into<String>, level: u8) {
        self.blocks.push(ReportBlock::Heading {
            text: text.into(),
            level,
        });
    }

    pub fn text(&mut self, text: impl Into<String>) {
        self.blocks.push(ReportBlock::Text { text: text.into() });
    }

    pub fn matrix(&mut self, rows: [[f64; 4]; 4]) {
        self.blocks.push(ReportBlock::Matrix { rows });
    }

    pub fn image(&mut self, name: impl Into<String>) {
        self.blocks.push(ReportBlock::Image { name: name.into() });
    }

    pub fn blocks(&self) -> &[ReportBlock] {
        &self.blocks
    }

    /// Matrix blocks in order.
    pub fn matrices(&self) -> impl Iterator<Item = &[[f64; 4]; 4]> {
        self.blocks.iter().filter_map(|b| match b {
            ReportBlock::Matrix { rows } => Some(rows),
            _ => None,
        })
    }

    /// Text blocks in order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().filter_map(|b| match b {
            ReportBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Named pages in the order they were added.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pages: Vec<NamedPage>,
}

#[derive(Debug, Clone, Serialize)]
struct NamedPage {
    name: String,
    page: ReportPage,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a page. A page with the same name replaces the earlier one.
    pub fn add(&mut self, name: impl Into<String>, page: ReportPage) {
        let name = name.into();
        match self.pages.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.page = page,
            None => self.pages.push(NamedPage { name, page }),
        }
    }

    pub fn page(&self, name: &str) -> Option<&ReportPage> {
        self.pages.iter().find(|p| p.name == name).map(|p| &p.page)
    }

    /// Page names in order.
    pub fn page_names(&self) -> Vec<&str> {
        self.pages.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::external(format!("cannot serialise report: {e}")))
    }
}
