use crate::applier::GridRow;

/// Pagination metadata for one table's materialized window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageState {
    pub current_page: usize,
    pub page_size: usize,
    /// Best-effort count maintained incrementally and periodically corrected.
    pub total_records: u64,
    pub has_new_records_on_previous_pages: bool,
    pub has_realtime_updates: bool,
    pub last_realtime_update_ms: Option<u64>,
}

impl PageState {
    pub fn new(page_size: usize) -> Self {
        Self {
            current_page: 0,
            page_size: page_size.max(1),
            total_records: 0,
            has_new_records_on_previous_pages: false,
            has_realtime_updates: false,
            last_realtime_update_ms: None,
        }
    }

    /// Never zero: an empty table still has one (empty) page.
    pub fn total_pages(&self) -> usize {
        let total = self.total_records.max(1);
        total.div_ceil(self.page_size as u64) as usize
    }

    pub(crate) fn add_records(&mut self, n: u64) {
        self.total_records = self.total_records.saturating_add(n);
    }

    pub(crate) fn remove_records(&mut self, n: u64) {
        self.total_records = self.total_records.saturating_sub(n);
    }
}

/// Read projection handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageView {
    pub rows: Vec<GridRow>,
    pub current_page: usize,
    pub page_size: usize,
    pub total_records: u64,
    pub total_pages: usize,
    pub has_new_records_on_previous_pages: bool,
    pub has_realtime_updates: bool,
    pub last_realtime_update_ms: Option<u64>,
}

/// "New records available" affordance, present only while the user is past
/// page 0 and additions landed on earlier pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewRecordsNotice {
    pub current_page: usize,
    pub total_records: u64,
}
