//! Tabular-file secondary sink — an xlsx workbook mirror.
//!
//! Loads the workbook when the file already exists, otherwise starts a fresh
//! one. The `crypto_calls` worksheet and its header row are created lazily on
//! the first write; every append saves the workbook so a crash loses at most
//! the in-flight row.

use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};
use umya_spreadsheet::{Spreadsheet, Worksheet};

use crate::db::CallRecord;
use crate::sinks::{CallSink, SinkError, CALL_COLUMNS};

const SHEET_NAME: &str = "crypto_calls";

pub struct ExcelSink {
    path: PathBuf,
    book: Spreadsheet,
    dirty: bool,
    closed: bool,
}

impl ExcelSink {
    /// Open the sink. The file itself is only written on the first append.
    pub fn open(path: PathBuf) -> Result<Self, SinkError> {
        let book = if path.exists() {
            umya_spreadsheet::reader::xlsx::read(&path)
                .map_err(|e| SinkError::Io(format!("read {}: {e}", path.display())))?
        } else {
            // Drop the default empty sheet; ours is created on first write.
            let mut book = umya_spreadsheet::new_file();
            let _ = book.remove_sheet_by_name("Sheet1");
            book
        };

        info!("excel sink ready at {}", path.display());
        Ok(ExcelSink { path, book, dirty: false, closed: false })
    }

    /// Worksheet plus its header row, created on first use.
    fn worksheet(&mut self) -> Result<&mut Worksheet, SinkError> {
        if self.book.get_sheet_by_name(SHEET_NAME).is_none() {
            self.book
                .new_sheet(SHEET_NAME)
                .map_err(|e| SinkError::Io(format!("create worksheet: {e}")))?;
        }

        let sheet = self
            .book
            .get_sheet_by_name_mut(SHEET_NAME)
            .ok_or_else(|| SinkError::Io("worksheet disappeared".to_string()))?;

        if sheet.get_value((1, 1)).is_empty() {
            for (i, header) in CALL_COLUMNS.iter().enumerate() {
                sheet.get_cell_mut((i as u32 + 1, 1)).set_value(*header);
            }
            debug!("created headers in {SHEET_NAME}");
        }

        Ok(sheet)
    }

    fn save(&self) -> Result<(), SinkError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SinkError::Io(format!("create {}: {e}", parent.display())))?;
            }
        }
        umya_spreadsheet::writer::xlsx::write(&self.book, &self.path)
            .map_err(|e| SinkError::Io(format!("write {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl CallSink for ExcelSink {
    fn name(&self) -> &'static str {
        "excel"
    }

    async fn append_call(&mut self, record: &CallRecord) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }

        let sheet = self.worksheet()?;
        let row = sheet.get_highest_row() + 1;

        set_opt_str(sheet, 1, row, record.token_name.as_deref());
        set_opt_num(sheet, 2, row, record.entry_cap);
        set_opt_num(sheet, 3, row, record.peak_cap);
        set_opt_num(sheet, 4, row, record.x_gain);
        set_opt_num(sheet, 5, row, record.vip_x);
        sheet.get_cell_mut((6u32, row)).set_value(record.message_type.as_str());
        set_opt_str(sheet, 7, row, record.contract_address.as_deref());
        set_opt_str(sheet, 8, row, record.time_to_peak.as_deref());
        set_opt_num(sheet, 9, row, record.linked_crypto_call_id.map(|v| v as f64));
        sheet.get_cell_mut((10u32, row)).set_value(record.timestamp.as_str());
        set_opt_num(sheet, 11, row, Some(record.message_id as f64));
        sheet.get_cell_mut((12u32, row)).set_value(record.channel_name.as_str());

        self.dirty = true;
        self.save()?;
        debug!(
            "appended call {} ({}) to {}",
            record.message_id,
            record.token_name.as_deref().unwrap_or("unknown"),
            self.path.display()
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.dirty {
            self.save()?;
        }
        debug!("excel sink closed");
        Ok(())
    }
}

fn set_opt_str(sheet: &mut Worksheet, col: u32, row: u32, value: Option<&str>) {
    if let Some(value) = value {
        sheet.get_cell_mut((col, row)).set_value(value);
    }
}

fn set_opt_num(sheet: &mut Worksheet, col: u32, row: u32, value: Option<f64>) {
    if let Some(value) = value {
        sheet.get_cell_mut((col, row)).set_value_number(value);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
