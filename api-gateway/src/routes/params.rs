//! Query string parameters
//!
//! `org_guid` may repeat, so the query is read as ordered pairs.

use paasbill_common::{EventFilter, RangeFilter};

use crate::error::ApiError;

pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn event_filter(&self) -> Result<EventFilter, ApiError> {
        Ok(EventFilter::parse(
            self.get("range_start"),
            self.get("range_stop"),
            &self.all("org_guid"),
        )?)
    }

    pub fn range_filter(&self) -> Result<RangeFilter, ApiError> {
        Ok(RangeFilter::parse(self.get("range_start"), self.get("range_stop"))?)
    }
}
