//! Addressing grammar.
//!
//! - `//SP-ID/CSE-ID/...` absolute
//! - `/CSE-ID/...` SP-relative (CSE-relative to the named CSE)
//! - `...` relative to this CSE (structured path or bare resource ID)
//! - `.` or `./...` relative to this CSE's base resource
//!
//! Local targets normalize to the same CSE-relative path regardless of form.

use crate::error::{CseError, CseResult};

/// Identity of the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CseIdentity {
    pub sp_id: String,
    /// CSE-ID without the leading slash.
    pub cse_id: String,
    /// Resource name of the CSE base.
    pub base_name: String,
}

impl CseIdentity {
    #[must_use]
    pub fn new(
        sp_id: impl Into<String>,
        cse_id: impl Into<String>,
        base_name: impl Into<String>,
    ) -> Self {
        Self {
            sp_id: sp_id.into(),
            cse_id: cse_id.into().trim_start_matches('/').to_owned(),
            base_name: base_name.into(),
        }
    }

    /// SP-relative CSE-ID, e.g. `/mn-cse`.
    #[must_use]
    pub fn sp_relative_id(&self) -> String {
        format!("/{}", self.cse_id)
    }

    /// Absolute CSE-ID, e.g. `//openmtc.org/mn-cse`.
    #[must_use]
    pub fn absolute_id(&self) -> String {
        format!("//{}/{}", self.sp_id, self.cse_id)
    }

    /// Qualifies a local path or ID with this node's SP-relative prefix.
    #[must_use]
    pub fn qualify(&self, local: &str) -> String {
        if local.starts_with('/') {
            local.to_owned()
        } else {
            format!("/{}/{}", self.cse_id, local)
        }
    }

    /// Brings an originator or rule subject into absolute form so that
    /// differently prefixed spellings of the same identity compare equal.
    #[must_use]
    pub fn absolute_originator(&self, originator: &str) -> String {
        if originator.starts_with("//") {
            originator.to_owned()
        } else if originator.starts_with('/') {
            format!("//{}{}", self.sp_id, originator)
        } else {
            format!("//{}/{}/{}", self.sp_id, self.cse_id, originator)
        }
    }

    /// Whether `originator` is this node itself.
    #[must_use]
    pub fn is_self(&self, originator: &str) -> bool {
        let abs = self.absolute_originator(originator);
        abs == self.absolute_id()
    }
}

/// Where a request target lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Hosted here; CSE-relative path or resource ID.
    Local(String),
    /// Hosted by another CSE.
    Remote { cse_id: String },
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn local_path(identity: &CseIdentity, rest: &[&str]) -> Target {
    if rest.is_empty() {
        Target::Local(identity.base_name.clone())
    } else {
        Target::Local(rest.join("/"))
    }
}

/// Normalizes a request target against the local identity.
///
/// # Errors
///
/// Returns `BadRequest` for an empty target or a malformed absolute form.
pub fn normalize(to: &str, identity: &CseIdentity) -> CseResult<Target> {
    let to = to.trim();
    if to.is_empty() {
        return Err(CseError::BadRequest("empty target".into()));
    }

    if let Some(abs) = to.strip_prefix("//") {
        let segs = segments(abs);
        let [sp, cse, rest @ ..] = segs.as_slice() else {
            return Err(CseError::BadRequest(format!("malformed absolute target {to}")));
        };
        if *sp == identity.sp_id && *cse == identity.cse_id {
            return Ok(local_path(identity, rest));
        }
        return Ok(Target::Remote {
            cse_id: (*cse).to_owned(),
        });
    }

    if let Some(sp_rel) = to.strip_prefix('/') {
        let segs = segments(sp_rel);
        let Some((cse, rest)) = segs.split_first() else {
            return Err(CseError::BadRequest(format!("malformed target {to}")));
        };
        if *cse == identity.cse_id {
            return Ok(local_path(identity, rest));
        }
        return Ok(Target::Remote {
            cse_id: (*cse).to_owned(),
        });
    }

    if to == "." {
        return Ok(Target::Local(identity.base_name.clone()));
    }
    if let Some(rel) = to.strip_prefix("./") {
        let segs = segments(rel);
        let mut path = identity.base_name.clone();
        for seg in segs {
            path.push('/');
            path.push_str(seg);
        }
        return Ok(Target::Local(path));
    }

    Ok(Target::Local(segments(to).join("/")))
}

/// CSE-ID a target address names, for absolute and SP-relative forms.
#[must_use]
pub fn target_cse(to: &str) -> Option<String> {
    if let Some(abs) = to.strip_prefix("//") {
        return segments(abs).get(1).map(|s| (*s).to_owned());
    }
    to.strip_prefix('/')
        .and_then(|rel| segments(rel).first().map(|s| (*s).to_owned()))
}

/// Splits a CSE-relative path into parent path and last segment.
#[must_use]
pub fn split_last(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once('/')
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn me() -> CseIdentity {
        CseIdentity::new("openmtc.org", "mn-cse", "onem2m")
    }

    #[test]
    fn all_forms_of_base_agree() {
        let id = me();
        for to in ["//openmtc.org/mn-cse", "/mn-cse", "/mn-cse/", ".", "onem2m"] {
            assert_eq!(
                normalize(to, &id).unwrap(),
                Target::Local("onem2m".into()),
                "{to}"
            );
        }
    }

    #[test]
    fn foreign_prefixes_are_remote() {
        let id = me();
        assert_eq!(
            normalize("/in-cse/onem2m/x", &id).unwrap(),
            Target::Remote {
                cse_id: "in-cse".into()
            }
        );
        assert_eq!(
            normalize("//other.org/mn-cse/onem2m", &id).unwrap(),
            Target::Remote {
                cse_id: "mn-cse".into()
            }
        );
        assert_eq!(target_cse("//sp/in-cse/a"), Some("in-cse".into()));
        assert_eq!(target_cse("/in-cse/a"), Some("in-cse".into()));
        assert_eq!(target_cse("onem2m/a"), None);
    }

    #[test]
    fn dot_prefix_is_base_relative() {
        assert_eq!(
            normalize("./MYAPP/data", &me()).unwrap(),
            Target::Local("onem2m/MYAPP/data".into())
        );
    }

    #[test]
    fn originators_compare_prefix_normalized() {
        let id = me();
        assert_eq!(
            id.absolute_originator("Cabc"),
            "//openmtc.org/mn-cse/Cabc"
        );
        assert_eq!(
            id.absolute_originator("/mn-cse/Cabc"),
            "//openmtc.org/mn-cse/Cabc"
        );
        assert!(id.is_self("/mn-cse"));
        assert!(id.is_self("//openmtc.org/mn-cse"));
        assert!(!id.is_self("/in-cse"));
        assert!(normalize("", &id).is_err());
        assert!(normalize("//sp-only", &id).is_err());
    }

    proptest! {
        #[test]
        fn absolute_sp_relative_and_relative_agree(
            segs in prop::collection::vec("[A-Za-z0-9_-]{1,8}", 1..5)
        ) {
            let id = me();
            let rel = segs.join("/");
            let expected = normalize(&rel, &id).unwrap();
            prop_assert_eq!(normalize(&format!("/mn-cse/{rel}"), &id).unwrap(), expected.clone());
            prop_assert_eq!(normalize(&format!("//openmtc.org/mn-cse/{rel}"), &id).unwrap(), expected);
        }
    }
}
