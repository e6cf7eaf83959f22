//! Filter predicates over single resources.
//!
//! Each present condition is an independent predicate; a resource matches
//! when all of them hold. A condition on an attribute the resource does not
//! carry is a non-match, never an error. `lim`, `ofst` and `lvl` shape the
//! walk and are applied by the discovery engine, not here.

use chrono::{DateTime, Utc};

use crate::request::FilterCriteria;
use crate::resource::Resource;

fn time_pred(
    bound: Option<DateTime<Utc>>,
    value: Option<DateTime<Utc>>,
    holds: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
) -> bool {
    match (bound, value) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(bound), Some(value)) => holds(value, bound),
    }
}

fn num_pred(bound: Option<u64>, value: Option<u64>, holds: impl Fn(u64, u64) -> bool) -> bool {
    match (bound, value) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(bound), Some(value)) => holds(value, bound),
    }
}

/// Whether `resource` satisfies every condition present in `fc`.
#[must_use]
pub fn matches(fc: &FilterCriteria, resource: &Resource) -> bool {
    let created = Some(resource.creation_time);
    let modified = Some(resource.last_modified_time);
    let size = resource.attr_u64("cs");

    time_pred(fc.created_before, created, |v, b| v < b)
        && time_pred(fc.created_after, created, |v, b| v > b)
        && time_pred(fc.modified_since, modified, |v, b| v > b)
        && time_pred(fc.unmodified_since, modified, |v, b| v < b)
        && time_pred(fc.expire_before, resource.expiration_time, |v, b| v < b)
        && time_pred(fc.expire_after, resource.expiration_time, |v, b| v > b)
        && num_pred(fc.state_tag_smaller, resource.state_tag(), |v, b| v < b)
        && num_pred(fc.state_tag_bigger, resource.state_tag(), |v, b| v > b)
        && num_pred(fc.size_above, size, |v, b| v >= b)
        && num_pred(fc.size_below, size, |v, b| v < b)
        && (fc.labels.is_empty() || fc.labels.iter().any(|l| resource.labels.contains(l)))
        && (fc.resource_types.is_empty() || fc.resource_types.contains(&resource.resource_type))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::resource::ResourceType;

    fn cin(labels: &[&str], size: u64) -> Resource {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut r = Resource::new(ResourceType::ContentInstance, t);
        r.labels = labels.iter().map(|s| (*s).to_owned()).collect();
        r.set_attr("cs", size);
        r.set_attr("st", 0);
        r
    }

    #[test]
    fn empty_criteria_match_everything() {
        assert!(matches(&FilterCriteria::default(), &cin(&[], 0)));
    }

    #[test]
    fn labels_match_any() {
        let fc = FilterCriteria {
            labels: vec!["a".into(), "z".into()],
            ..FilterCriteria::default()
        };
        assert!(matches(&fc, &cin(&["a", "b"], 1)));
        assert!(!matches(&fc, &cin(&["b"], 1)));
    }

    #[test]
    fn missing_attribute_is_non_match() {
        let fc = FilterCriteria {
            expire_before: Some(Utc::now()),
            ..FilterCriteria::default()
        };
        assert!(!matches(&fc, &cin(&[], 1)));

        let mut ae = Resource::new(ResourceType::Ae, Utc::now());
        ae.labels.push("a".into());
        let sized = FilterCriteria {
            size_above: Some(0),
            ..FilterCriteria::default()
        };
        assert!(!matches(&sized, &ae));
    }

    #[test]
    fn predicates_are_conjunctive() {
        let r = cin(&["a"], 10);
        let fc = FilterCriteria {
            labels: vec!["a".into()],
            size_above: Some(5),
            size_below: Some(20),
            created_after: Some(r.creation_time - Duration::hours(1)),
            resource_types: vec![ResourceType::ContentInstance],
            ..FilterCriteria::default()
        };
        assert!(matches(&fc, &r));

        let too_small = FilterCriteria {
            size_above: Some(11),
            ..fc.clone()
        };
        assert!(!matches(&too_small, &r));

        let wrong_type = FilterCriteria {
            resource_types: vec![ResourceType::Container],
            ..fc
        };
        assert!(!matches(&wrong_type, &r));
    }
}
