use crate::storage::RecordId;

use self::value::Value;

pub mod schema;
pub mod value;

#[derive(Clone, Debug, PartialEq)]
pub struct Tuple {
    values: Vec<Value>,
    /// where the tuple is stored, None until it has been inserted
    record_id: Option<RecordId>,
}

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            record_id: None,
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub(crate) fn set_record_id(&mut self, record_id: Option<RecordId>) {
        self.record_id = record_id;
    }
}
