//! Discovery: a depth-first pre-order walk over the descendants of the
//! target, collecting those that match the filter criteria and that the
//! originator may discover.
//!
//! Nodes the originator may not discover are left out of the result while
//! the walk still descends below them; the request itself never fails on
//! them. `lvl` bounds the depth, `ofst` skips leading matches and `lim` stops
//! the walk, flagging the response as truncated when a further match exists.

use cse_core::{
    filter, AccessControlOperations, CseResult, DiscoveryResultType, Request, Resource,
    Response, ResponseStatusCode,
};
use serde_json::json;

use super::controllers::ControllerContext;

/// Result of one walk.
#[derive(Debug, Default)]
pub struct Discovered {
    pub resources: Vec<Resource>,
    pub truncated: bool,
}

/// Walks the subtree below `root`.
///
/// # Errors
///
/// Storage failures only.
pub async fn walk(ctx: &ControllerContext, root: &Resource, req: &Request) -> CseResult<Discovered> {
    let fc = &req.filter_criteria;
    let session = ctx.session();
    let offset = fc.offset.unwrap_or(0);
    let mut skipped = 0;
    let mut found = Discovered::default();

    let mut stack: Vec<(Resource, usize)> = Vec::new();
    push_children(ctx, &mut stack, root, 1).await?;

    while let Some((node, depth)) = stack.pop() {
        if fc.level.is_none_or(|max| depth < max) {
            push_children(ctx, &mut stack, &node, depth + 1).await?;
        }

        if !filter::matches(fc, &node) {
            continue;
        }
        if !ctx
            .core
            .access
            .check(session, &node, req, AccessControlOperations::DISCOVER)
            .await?
        {
            continue;
        }
        if skipped < offset {
            skipped += 1;
            continue;
        }
        if fc.limit.is_some_and(|lim| found.resources.len() >= lim) {
            found.truncated = true;
            break;
        }
        found.resources.push(node);
    }
    Ok(found)
}

async fn push_children(
    ctx: &ControllerContext,
    stack: &mut Vec<(Resource, usize)>,
    parent: &Resource,
    depth: usize,
) -> CseResult<()> {
    let children = ctx.session().get_collection(None, &parent.resource_id).await?;
    stack.extend(children.into_iter().rev().map(|child| (child, depth)));
    Ok(())
}

/// Runs a discovery request and builds its `m2m:uril` response.
///
/// # Errors
///
/// Storage failures only.
pub async fn discover(ctx: &ControllerContext, root: &Resource, req: &Request) -> CseResult<Response> {
    let found = walk(ctx, root, req).await?;
    let unstructured = req.discovery_result_type == Some(DiscoveryResultType::Unstructured);
    let uris: Vec<String> = found
        .resources
        .into_iter()
        .map(|r| if unstructured { r.resource_id } else { r.path })
        .collect();
    tracing::debug!(
        rqi = %req.request_identifier,
        root = %root.path,
        matches = uris.len(),
        truncated = found.truncated,
        "discovery complete"
    );
    let mut resp = Response::new(ResponseStatusCode::Ok, req, Some(json!({ "m2m:uril": uris })));
    resp.truncated = found.truncated;
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use cse_core::{FilterCriteria, FilterUsage, ResourceType};
    use serde_json::Value;

    use super::*;
    use crate::testing::TestNode;

    /// `box` holds c1 {a}, c2 {b}, c3 {a, b} and c4 {a}, the last one
    /// readable only by `Cowner`.
    async fn labelled_tree() -> (TestNode, String) {
        let node = TestNode::start().await;
        let acp = node
            .request(Request::create(
                "onem2m",
                "Cadmin",
                ResourceType::AccessControlPolicy,
                json!({"m2m:acp": {
                    "rn": "lock",
                    "pv": {"acr": [{"acor": ["Cowner"], "acop": 63}]},
                    "pvs": {"acr": [{"acor": ["Cadmin"], "acop": 63}]},
                }}),
            ))
            .await;
        let acp_id = acp.resource_attributes().unwrap()["ri"]
            .as_str()
            .unwrap()
            .to_owned();

        node.create_container("onem2m", "box").await;
        for (name, labels, acpi) in [
            ("c1", vec!["a"], None),
            ("c2", vec!["b"], None),
            ("c3", vec!["a", "b"], None),
            ("c4", vec!["a"], Some(acp_id.clone())),
        ] {
            let mut cnt = json!({"rn": name, "lbl": labels});
            if let Some(id) = acpi {
                cnt["acpi"] = json!([id]);
            }
            let resp = node
                .request(Request::create(
                    "onem2m/box",
                    "Cadmin",
                    ResourceType::Container,
                    json!({ "m2m:cnt": cnt }),
                ))
                .await;
            assert_eq!(resp.status, ResponseStatusCode::Created, "{:?}", resp.content);
        }
        (node, acp_id)
    }

    fn discovery(labels: &[&str]) -> FilterCriteria {
        FilterCriteria {
            filter_usage: Some(FilterUsage::Discovery),
            labels: labels.iter().map(|l| (*l).to_owned()).collect(),
            ..FilterCriteria::default()
        }
    }

    fn uris(resp: &Response) -> Vec<String> {
        resp.content.as_ref().unwrap()["m2m:uril"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()
    }

    #[tokio::test]
    async fn hidden_matches_are_left_out_in_walk_order() {
        let (node, _) = labelled_tree().await;
        let resp = node
            .request(Request::retrieve("onem2m/box", "Cx").with_filter(discovery(&["a"])))
            .await;
        assert_eq!(resp.status, ResponseStatusCode::Ok);
        assert_eq!(uris(&resp), vec!["onem2m/box/c1", "onem2m/box/c3"]);
        assert!(!resp.truncated);

        let owner = node
            .request(Request::retrieve("onem2m/box", "Cowner").with_filter(discovery(&["a"])))
            .await;
        assert_eq!(
            uris(&owner),
            vec!["onem2m/box/c1", "onem2m/box/c3", "onem2m/box/c4"]
        );
    }

    #[tokio::test]
    async fn limit_and_offset_page_through_matches() {
        let (node, _) = labelled_tree().await;

        let mut fc = discovery(&["a"]);
        fc.limit = Some(1);
        let first = node
            .request(Request::retrieve("onem2m/box", "Cowner").with_filter(fc))
            .await;
        assert_eq!(uris(&first), vec!["onem2m/box/c1"]);
        assert!(first.truncated);

        let mut fc = discovery(&["a"]);
        fc.offset = Some(1);
        let rest = node
            .request(Request::retrieve("onem2m/box", "Cowner").with_filter(fc))
            .await;
        assert_eq!(uris(&rest), vec!["onem2m/box/c3", "onem2m/box/c4"]);
        assert!(!rest.truncated);
    }

    #[tokio::test]
    async fn level_and_result_type() {
        let (node, _) = labelled_tree().await;
        node.create_instance("onem2m/box/c1", "v").await;

        let mut fc = discovery(&[]);
        fc.resource_types = vec![ResourceType::ContentInstance];
        let deep = node
            .request(Request::retrieve("onem2m", "Cx").with_filter(fc.clone()))
            .await;
        assert_eq!(uris(&deep).len(), 1);

        fc.level = Some(2);
        let shallow = node
            .request(Request::retrieve("onem2m", "Cx").with_filter(fc))
            .await;
        assert!(uris(&shallow).is_empty());

        let mut req = Request::retrieve("onem2m/box", "Cx").with_filter(discovery(&["b"]));
        req.discovery_result_type = Some(DiscoveryResultType::Unstructured);
        let ids = uris(&node.request(req).await);
        let c2 = node.get("onem2m/box/c2").await.unwrap();
        let c3 = node.get("onem2m/box/c3").await.unwrap();
        assert_eq!(ids, vec![c2.resource_id, c3.resource_id]);
    }
}
