use serde::{Deserialize, Serialize};

use super::ids::BigId;
use super::temporal::TemporalFilter;

/// Keyword match on the free-text description of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullTextFilter {
    pub keywords: Vec<String>,
}

impl FullTextFilter {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
        }
    }
}

/// Spatial constraint, matched with `ST_Intersects` against the feature geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFilter {
    /// Geometry in well-known text.
    pub wkt: String,
    #[serde(default = "default_srid")]
    pub srid: i32,
}

fn default_srid() -> i32 {
    4326
}

impl LocationFilter {
    pub fn intersects(wkt: impl Into<String>) -> Self {
        Self {
            wkt: wkt.into(),
            srid: default_srid(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObsFilter {
    pub internal_ids: Option<Vec<BigId>>,
    pub datastream: Option<Box<DataStreamFilter>>,
    pub foi: Option<Box<FoiFilter>>,
    pub phenomenon_time: Option<TemporalFilter>,
    pub result_time: Option<TemporalFilter>,
    pub limit: Option<u64>,
}

impl ObsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = BigId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_datastream(mut self, filter: DataStreamFilter) -> Self {
        self.datastream = Some(Box::new(filter));
        self
    }

    pub fn with_foi(mut self, filter: FoiFilter) -> Self {
        self.foi = Some(Box::new(filter));
        self
    }

    pub fn with_phenomenon_time(mut self, filter: TemporalFilter) -> Self {
        self.phenomenon_time = Some(filter);
        self
    }

    pub fn with_result_time(mut self, filter: TemporalFilter) -> Self {
        self.result_time = Some(filter);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataStreamFilter {
    pub internal_ids: Option<Vec<BigId>>,
    pub full_text: Option<FullTextFilter>,
    pub valid_time: Option<TemporalFilter>,
    pub output_names: Option<Vec<String>>,
    pub observed_properties: Option<Vec<String>>,
    pub system: Option<Box<SystemFilter>>,
    pub observation: Option<Box<ObsFilter>>,
}

impl DataStreamFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = BigId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_full_text(mut self, filter: FullTextFilter) -> Self {
        self.full_text = Some(filter);
        self
    }

    pub fn with_valid_time(mut self, filter: TemporalFilter) -> Self {
        self.valid_time = Some(filter);
        self
    }

    pub fn with_output_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_observed_properties<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.observed_properties = Some(uris.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_system(mut self, filter: SystemFilter) -> Self {
        self.system = Some(Box::new(filter));
        self
    }

    pub fn with_observation(mut self, filter: ObsFilter) -> Self {
        self.observation = Some(Box::new(filter));
        self
    }

    /// The internal id set, when it is the only constraint of this filter.
    pub fn only_internal_ids(&self) -> Option<&[BigId]> {
        let ids = self.internal_ids.as_deref()?;
        let only_ids = self.full_text.is_none()
            && self.valid_time.is_none()
            && self.output_names.is_none()
            && self.observed_properties.is_none()
            && self.system.is_none()
            && self.observation.is_none();
        only_ids.then_some(ids)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FoiFilter {
    pub internal_ids: Option<Vec<BigId>>,
    pub unique_ids: Option<Vec<String>>,
    pub valid_time: Option<TemporalFilter>,
    pub full_text: Option<FullTextFilter>,
    pub location: Option<LocationFilter>,
    pub parent: Option<Box<FoiFilter>>,
    pub observation: Option<Box<ObsFilter>>,
}

impl FoiFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = BigId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_unique_ids<I, S>(mut self, uids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_ids = Some(uids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_valid_time(mut self, filter: TemporalFilter) -> Self {
        self.valid_time = Some(filter);
        self
    }

    pub fn with_full_text(mut self, filter: FullTextFilter) -> Self {
        self.full_text = Some(filter);
        self
    }

    pub fn with_location(mut self, filter: LocationFilter) -> Self {
        self.location = Some(filter);
        self
    }

    pub fn with_parent(mut self, filter: FoiFilter) -> Self {
        self.parent = Some(Box::new(filter));
        self
    }

    pub fn with_observation(mut self, filter: ObsFilter) -> Self {
        self.observation = Some(Box::new(filter));
        self
    }

    pub fn only_internal_ids(&self) -> Option<&[BigId]> {
        let ids = self.internal_ids.as_deref()?;
        let only_ids = self.unique_ids.is_none() && !self.needs_linked_table();
        only_ids.then_some(ids)
    }

    /// True when some predicate can only be evaluated on the feature table.
    pub fn needs_linked_table(&self) -> bool {
        self.valid_time.is_some()
            || self.full_text.is_some()
            || self.location.is_some()
            || self.parent.is_some()
            || self.observation.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemFilter {
    pub internal_ids: Option<Vec<BigId>>,
    pub unique_ids: Option<Vec<String>>,
    /// Also match members (sub-systems) of the selected systems.
    pub include_members: bool,
    pub valid_time: Option<TemporalFilter>,
    pub full_text: Option<FullTextFilter>,
    pub location: Option<LocationFilter>,
    pub parent: Option<Box<SystemFilter>>,
    pub datastream: Option<Box<DataStreamFilter>>,
}

impl SystemFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = BigId>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_unique_ids<I, S>(mut self, uids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_ids = Some(uids.into_iter().map(Into::into).collect());
        self
    }

    pub fn including_members(mut self) -> Self {
        self.include_members = true;
        self
    }

    pub fn with_valid_time(mut self, filter: TemporalFilter) -> Self {
        self.valid_time = Some(filter);
        self
    }

    pub fn with_full_text(mut self, filter: FullTextFilter) -> Self {
        self.full_text = Some(filter);
        self
    }

    pub fn with_location(mut self, filter: LocationFilter) -> Self {
        self.location = Some(filter);
        self
    }

    pub fn with_parent(mut self, filter: SystemFilter) -> Self {
        self.parent = Some(Box::new(filter));
        self
    }

    pub fn with_datastream(mut self, filter: DataStreamFilter) -> Self {
        self.datastream = Some(Box::new(filter));
        self
    }

    pub fn only_internal_ids(&self) -> Option<&[BigId]> {
        let ids = self.internal_ids.as_deref()?;
        let only_ids = self.unique_ids.is_none() && !self.needs_linked_table();
        only_ids.then_some(ids)
    }

    /// True when some predicate can only be evaluated on the system table.
    pub fn needs_linked_table(&self) -> bool {
        self.include_members
            || self.valid_time.is_some()
            || self.full_text.is_some()
            || self.location.is_some()
            || self.parent.is_some()
            || self.datastream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filters_are_unconstrained() {
        let f = ObsFilter::new();
        assert!(f.internal_ids.is_none());
        assert!(f.datastream.is_none());
        assert!(f.phenomenon_time.is_none());
    }

    #[test]
    fn test_datastream_only_internal_ids() {
        let f = DataStreamFilter::new().with_internal_ids([BigId::new(1), BigId::new(2)]);
        assert_eq!(f.only_internal_ids(), Some(&[BigId::new(1), BigId::new(2)][..]));

        let f = f.with_output_names(["temp"]);
        assert_eq!(f.only_internal_ids(), None);
        assert_eq!(DataStreamFilter::new().only_internal_ids(), None);
    }

    #[test]
    fn test_foi_only_internal_ids() {
        let f = FoiFilter::new().with_internal_ids([BigId::new(5)]);
        assert_eq!(f.only_internal_ids(), Some(&[BigId::new(5)][..]));
        assert!(!f.needs_linked_table());

        let with_uids = f.clone().with_unique_ids(["urn:foi:1"]);
        assert_eq!(with_uids.only_internal_ids(), None);

        let with_location = f.with_location(LocationFilter::intersects("POINT(1 2)"));
        assert_eq!(with_location.only_internal_ids(), None);
        assert!(with_location.needs_linked_table());
    }

    #[test]
    fn test_system_include_members_needs_table() {
        let f = SystemFilter::new().with_internal_ids([BigId::new(1)]);
        assert!(!f.needs_linked_table());
        assert!(f.including_members().needs_linked_table());
    }

    #[test]
    fn test_deserialize_nested_filter() {
        let json = r#"{
            "datastream": { "output_names": ["weather"], "system": { "unique_ids": ["urn:sys:*"] } },
            "foi": { "internal_ids": [0] },
            "phenomenon_time": { "mode": "latest" }
        }"#;
        let f: ObsFilter = serde_json::from_str(json).unwrap();
        let ds = f.datastream.as_ref().unwrap();
        assert_eq!(ds.output_names.as_deref(), Some(&["weather".to_string()][..]));
        assert!(ds.system.is_some());
        assert_eq!(f.foi.unwrap().internal_ids, Some(vec![BigId::NONE]));
        assert_eq!(f.phenomenon_time, Some(TemporalFilter::Latest));
    }

    #[test]
    fn test_location_default_srid() {
        let f: LocationFilter = serde_json::from_str(r#"{"wkt":"POINT(0 0)"}"#).unwrap();
        assert_eq!(f.srid, 4326);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_json::from_str::<FoiFilter>(r#"{"bogus": 1}"#).is_err());
    }
}
