use super::{CorrelationId, FinishedRecord, NewRecord, RecordStore, StoreError};
use crate::protocol::ParamValue;

/// One record held by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub id: CorrelationId,
    pub record: NewRecord,
    pub params: Vec<ParamValue>,
    pub outcome: Option<FinishedRecord>,
    /// Set when the tracker gave up on the record.
    pub abandoned: bool,
}

/// Record store kept in a `Vec`. Ids start at 1.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<MemoryRecord>,
    failing: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails, for exercising the non-fatal paths.
    pub fn failing() -> Self {
        Self { records: Vec::new(), failing: true }
    }

    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    pub fn records(&self) -> &[MemoryRecord] {
        &self.records
    }

    pub fn get(&self, id: CorrelationId) -> Option<&MemoryRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        Ok(())
    }

    fn get_mut(&mut self, id: CorrelationId) -> Result<&mut MemoryRecord, StoreError> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::UnknownRecord(id))
    }
}

impl RecordStore for MemoryStore {
    fn create_record(&mut self, record: &NewRecord) -> Result<CorrelationId, StoreError> {
        self.check()?;
        let id = self.records.len() as CorrelationId + 1;
        self.records.push(MemoryRecord {
            id,
            record: record.clone(),
            params: Vec::new(),
            outcome: None,
            abandoned: false,
        });
        Ok(id)
    }

    fn store_parameters(&mut self, id: CorrelationId, params: &[ParamValue]) -> Result<(), StoreError> {
        self.check()?;
        self.get_mut(id)?.params = params.to_vec();
        Ok(())
    }

    fn finish_record(&mut self, id: CorrelationId, outcome: &FinishedRecord) -> Result<(), StoreError> {
        self.check()?;
        self.get_mut(id)?.outcome = Some(outcome.clone());
        Ok(())
    }

    fn discard_record(&mut self, id: CorrelationId) -> Result<(), StoreError> {
        self.check()?;
        self.get_mut(id)?.abandoned = true;
        Ok(())
    }
}
