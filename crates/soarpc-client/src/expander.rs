//! Response expansions: replacing identifiers inside response objects with
//! the full objects they reference, fetched in batched follow-up calls.
//!
//! An object participates by carrying a `_type` field. The expansion
//! configuration maps each type to its possible expansions, and each
//! expansion to a *route*: the service/action to call, the request field
//! that takes the collected ids, and the response field holding the
//! id-to-object map that comes back. Expansions may nest
//! (`"profile.address"`), bounded by a depth limit and a visited set so
//! cyclic object graphs cannot loop.

use crate::client::{CallOptions, Client};
use crate::errors::ClientError;
use serde::Deserialize;
use soarpc_common::{ActionRequest, ActionResponse, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Expansions requested by a caller: `_type` name to expansion name
/// paths (dotted for nested expansions).
pub type Expansions = BTreeMap<String, Vec<String>>;

/// How to resolve one expansion: which action to call and through which
/// fields the ids and objects travel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeRoute {
    pub service: String,
    pub action: String,
    /// The request body field that takes the list of collected ids.
    pub request_field: String,
    /// The response body field holding the map from id to object.
    pub response_field: String,
}

/// One expansion available on a type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeExpansionSettings {
    /// The `_type` the expansion yields, for nested expansions; `None`
    /// ends the chain.
    #[serde(rename = "type")]
    pub expansion_type: Option<String>,
    /// Name of the [`TypeRoute`] that resolves this expansion.
    pub route: String,
    /// The field on the base object holding the identifier.
    pub source_field: String,
    /// The not-yet-existing field the fetched object is placed into.
    pub destination_field: String,
    /// Raise action errors encountered while expanding (suppressed by
    /// default, unlike normal calls).
    #[serde(default)]
    pub raise_action_errors: bool,
}

/// The full expansion configuration a client is constructed with.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpansionSettings {
    pub type_routes: BTreeMap<String, TypeRoute>,
    pub type_expansions: BTreeMap<String, BTreeMap<String, TypeExpansionSettings>>,
}

/// Nested expansions are cut off at this depth to break object cycles.
const MAX_EXPANSION_DEPTH: usize = 10;

#[derive(Debug, Clone)]
struct ExpansionNode {
    name: String,
    expansion_type: Option<String>,
    route: TypeRoute,
    source_field: String,
    destination_field: String,
    raise_action_errors: bool,
    children: Vec<ExpansionNode>,
}

struct TypeTree {
    type_name: String,
    expansions: Vec<ExpansionNode>,
}

/// Validated expansion configuration, able to turn a caller's compact
/// expansion dict into trees of expansion nodes.
pub(crate) struct ExpansionConverter {
    settings: ExpansionSettings,
}

impl ExpansionConverter {
    pub(crate) fn new(settings: ExpansionSettings) -> Result<Self, ClientError> {
        for (type_name, expansions) in &settings.type_expansions {
            for (name, expansion) in expansions {
                if !settings.type_routes.contains_key(&expansion.route) {
                    return Err(ClientError::InvalidExpansionKey(format!(
                        "expansion {}.{} names unknown route {}",
                        type_name, name, expansion.route
                    )));
                }
            }
        }
        Ok(Self { settings })
    }

    fn trees_for(&self, requested: &Expansions) -> Result<Vec<TypeTree>, ClientError> {
        let mut trees = Vec::new();
        for (type_name, names) in requested {
            if !self.settings.type_expansions.contains_key(type_name) {
                return Err(ClientError::InvalidExpansionKey(type_name.clone()));
            }
            let mut tree = TypeTree { type_name: type_name.clone(), expansions: Vec::new() };
            for name in names {
                let parts: Vec<&str> = name.split('.').collect();
                self.insert_path(&mut tree.expansions, type_name, &parts)?;
            }
            trees.push(tree);
        }
        Ok(trees)
    }

    fn insert_path(
        &self,
        children: &mut Vec<ExpansionNode>,
        current_type: &str,
        parts: &[&str],
    ) -> Result<(), ClientError> {
        let (part, rest) = parts.split_first().expect("paths are non-empty");
        let settings = self
            .settings
            .type_expansions
            .get(current_type)
            .and_then(|expansions| expansions.get(*part))
            .ok_or_else(|| {
                ClientError::InvalidExpansionKey(format!("{}.{}", current_type, part))
            })?;
        let route = self
            .settings
            .type_routes
            .get(&settings.route)
            .expect("routes were validated at construction");

        if !children.iter().any(|node| node.name == *part) {
            children.push(ExpansionNode {
                name: (*part).to_owned(),
                expansion_type: settings.expansion_type.clone(),
                route: route.clone(),
                source_field: settings.source_field.clone(),
                destination_field: settings.destination_field.clone(),
                raise_action_errors: settings.raise_action_errors,
                children: Vec::new(),
            });
        }
        let node = children
            .iter_mut()
            .find(|node| node.name == *part)
            .expect("node was just ensured");

        if !rest.is_empty() {
            let next_type = node.expansion_type.clone().ok_or_else(|| {
                ClientError::InvalidExpansionKey(format!(
                    "{} does not support nested expansion {}",
                    part,
                    rest.join(".")
                ))
            })?;
            self.insert_path(&mut node.children, &next_type, rest)?;
        }
        Ok(())
    }
}

/// A location inside a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

fn value_at_path<'v>(root: &'v Value, path: &[PathSegment]) -> Option<&'v Value> {
    let mut current = root;
    for segment in path {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Map(map)) => map.get(key)?,
            (PathSegment::Index(index), Value::List(list)) => list.get(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

fn value_at_path_mut<'v>(root: &'v mut Value, path: &[PathSegment]) -> Option<&'v mut Value> {
    let mut current = root;
    for segment in path {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Map(map)) => map.get_mut(key)?,
            (PathSegment::Index(index), Value::List(list)) => list.get_mut(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Finds the paths of all maps whose `_type` equals `type_name`. Matched
/// objects are not searched further (matching the behavior of the
/// expansion tree walk: an object expands, its innards expand through
/// nested expansion nodes).
fn find_typed_objects(
    value: &Value,
    type_name: &str,
    prefix: &mut Vec<PathSegment>,
    found: &mut Vec<Vec<PathSegment>>,
) {
    match value {
        Value::Map(map) => {
            if map.get("_type").and_then(Value::as_str) == Some(type_name) {
                found.push(prefix.clone());
                return;
            }
            for (key, entry) in map {
                prefix.push(PathSegment::Key(key.clone()));
                find_typed_objects(entry, type_name, prefix, found);
                prefix.pop();
            }
        }
        Value::List(list) => {
            for (index, entry) in list.iter().enumerate() {
                prefix.push(PathSegment::Index(index));
                find_typed_objects(entry, type_name, prefix, found);
                prefix.pop();
            }
        }
        _ => {}
    }
}

fn value_key(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        other => format!("{:?}", other),
    }
}

struct PendingRequest {
    request_field: String,
    response_field: String,
    values: Vec<Value>,
    value_keys: BTreeSet<String>,
    targets: Vec<(usize, Vec<PathSegment>, ExpansionNode)>,
}

/// Performs the requested expansions over a set of action responses,
/// issuing batched route calls and splicing the results in place.
///
/// Expansion is idempotent: objects whose destination field is already
/// present are skipped, so expanding an already-expanded response changes
/// nothing.
pub(crate) fn expand(
    client: &Client,
    converter: &ExpansionConverter,
    actions: &mut [ActionResponse],
    requested: &Expansions,
    options: &CallOptions,
) -> Result<(), ClientError> {
    let trees = converter.trees_for(requested)?;

    let mut work: Vec<(usize, Vec<PathSegment>, Vec<ExpansionNode>)> = Vec::new();
    for tree in &trees {
        for (index, action) in actions.iter().enumerate() {
            let mut prefix = Vec::new();
            let mut found = Vec::new();
            find_typed_objects(&action.body, &tree.type_name, &mut prefix, &mut found);
            for path in found {
                work.push((index, path, tree.expansions.clone()));
            }
        }
    }

    // Guards against cyclic object graphs: ids already fetched through a
    // route are never fetched again for this response.
    let mut visited: HashSet<(String, String, String)> = HashSet::new();

    let mut depth = 0;
    while !work.is_empty() && depth < MAX_EXPANSION_DEPTH {
        depth += 1;

        let mut pending: BTreeMap<(String, String), PendingRequest> = BTreeMap::new();
        for (index, path, nodes) in work.drain(..) {
            let Some(object) =
                value_at_path(&actions[index].body, &path).and_then(Value::as_map)
            else {
                continue;
            };
            for node in nodes {
                if object.contains_key(&node.destination_field) {
                    continue;
                }
                let Some(source) = object.get(&node.source_field) else { continue };
                if !source.is_truthy() {
                    continue;
                }
                let id_key = value_key(source);
                let route_key = (node.route.service.clone(), node.route.action.clone());
                if visited.contains(&(
                    route_key.0.clone(),
                    route_key.1.clone(),
                    id_key.clone(),
                )) {
                    continue;
                }
                let entry = pending.entry(route_key).or_insert_with(|| PendingRequest {
                    request_field: node.route.request_field.clone(),
                    response_field: node.route.response_field.clone(),
                    values: Vec::new(),
                    value_keys: BTreeSet::new(),
                    targets: Vec::new(),
                });
                if entry.value_keys.insert(id_key) {
                    entry.values.push(source.clone());
                }
                entry.targets.push((index, path.clone(), node));
            }
        }

        // Send one batched request per route; transport errors propagate.
        let mut requests_by_service: HashMap<String, HashMap<u64, PendingRequest>> =
            HashMap::new();
        for ((service, action), request) in pending {
            for id_key in &request.value_keys {
                visited.insert((service.clone(), action.clone(), id_key.clone()));
            }
            let mut body = BTreeMap::new();
            body.insert(
                request.request_field.clone(),
                Value::List(request.values.clone()),
            );
            let request_id = client.send_request(
                &service,
                vec![ActionRequest::new(&action, Value::Map(body))],
                options,
                false,
            )?;
            requests_by_service.entry(service).or_default().insert(request_id, request);
        }

        let mut job_errors_to_raise = Vec::new();
        let mut action_errors_to_raise = Vec::new();

        for (service, mut expected) in requests_by_service {
            let mut iter = client.get_all_responses(&service, options.timeout)?;
            for item in &mut iter {
                let (request_id, response) = item?;
                let Some(request) = expected.remove(&request_id) else {
                    tracing::warn!(request_id, "dropping uncorrelated expansion response");
                    continue;
                };

                if !response.errors.is_empty() {
                    if request.targets.iter().any(|(_, _, node)| node.raise_action_errors) {
                        job_errors_to_raise.extend(response.errors);
                    }
                    continue;
                }
                let Some(action_response) = response.actions.into_iter().next() else {
                    continue;
                };
                if !action_response.errors.is_empty() {
                    if request.targets.iter().any(|(_, _, node)| node.raise_action_errors) {
                        action_errors_to_raise.push(action_response);
                    }
                    continue;
                }
                let Some(objects) = action_response
                    .body
                    .get(&request.response_field)
                    .and_then(Value::as_map)
                    .map(Clone::clone)
                else {
                    continue;
                };

                for (index, path, node) in request.targets {
                    let Some(object) = value_at_path_mut(&mut actions[index].body, &path)
                        .and_then(Value::as_map_mut)
                    else {
                        continue;
                    };
                    if object.contains_key(&node.destination_field) {
                        continue;
                    }
                    let Some(id_key) = object.get(&node.source_field).map(value_key) else {
                        continue;
                    };
                    // A missing id in the returned map just means no match.
                    let Some(fetched) = objects.get(&id_key) else { continue };
                    object.insert(node.destination_field.clone(), fetched.clone());

                    if node.children.is_empty() {
                        continue;
                    }
                    let Some(nested_type) = &node.expansion_type else { continue };
                    let mut nested_prefix = path.clone();
                    nested_prefix.push(PathSegment::Key(node.destination_field.clone()));
                    let subtree = value_at_path(&actions[index].body, &nested_prefix).cloned();
                    if let Some(subtree) = subtree {
                        let mut found = Vec::new();
                        let mut relative = Vec::new();
                        find_typed_objects(&subtree, nested_type, &mut relative, &mut found);
                        for relative_path in found {
                            let mut absolute = nested_prefix.clone();
                            absolute.extend(relative_path);
                            work.push((index, absolute, node.children.clone()));
                        }
                    }
                }
            }
        }

        if !action_errors_to_raise.is_empty() {
            return Err(ClientError::CallActionError(action_errors_to_raise));
        }
        if !job_errors_to_raise.is_empty() {
            return Err(ClientError::JobError(job_errors_to_raise));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use soarpc_common::vmap;

    fn settings() -> ExpansionSettings {
        ExpansionSettings {
            type_routes: BTreeMap::from([(
                "user_route".to_owned(),
                TypeRoute {
                    service: "user".to_owned(),
                    action: "get_users".to_owned(),
                    request_field: "ids".to_owned(),
                    response_field: "users".to_owned(),
                },
            )]),
            type_expansions: BTreeMap::from([
                (
                    "ticket".to_owned(),
                    BTreeMap::from([(
                        "buyer".to_owned(),
                        TypeExpansionSettings {
                            expansion_type: Some("user".to_owned()),
                            route: "user_route".to_owned(),
                            source_field: "buyer_id".to_owned(),
                            destination_field: "buyer".to_owned(),
                            raise_action_errors: false,
                        },
                    )]),
                ),
                (
                    "user".to_owned(),
                    BTreeMap::from([(
                        "manager".to_owned(),
                        TypeExpansionSettings {
                            expansion_type: Some("user".to_owned()),
                            route: "user_route".to_owned(),
                            source_field: "manager_id".to_owned(),
                            destination_field: "manager".to_owned(),
                            raise_action_errors: false,
                        },
                    )]),
                ),
            ]),
        }
    }

    #[test]
    fn test_converter_rejects_unknown_route() {
        let mut bad = settings();
        bad.type_expansions
            .get_mut("ticket")
            .unwrap()
            .get_mut("buyer")
            .unwrap()
            .route = "nowhere".to_owned();
        assert!(ExpansionConverter::new(bad).is_err());
    }

    #[test]
    fn test_trees_reject_unknown_type_and_expansion() {
        let converter = ExpansionConverter::new(settings()).unwrap();
        let unknown_type = BTreeMap::from([("order".to_owned(), vec!["buyer".to_owned()])]);
        assert!(converter.trees_for(&unknown_type).is_err());

        let unknown_expansion =
            BTreeMap::from([("ticket".to_owned(), vec!["seller".to_owned()])]);
        assert!(converter.trees_for(&unknown_expansion).is_err());
    }

    #[test]
    fn test_nested_tree_construction() {
        let converter = ExpansionConverter::new(settings()).unwrap();
        let requested =
            BTreeMap::from([("ticket".to_owned(), vec!["buyer.manager".to_owned()])]);
        let trees = converter.trees_for(&requested).unwrap();
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].type_name, "ticket");
        assert_eq!(trees[0].expansions.len(), 1);
        assert_eq!(trees[0].expansions[0].name, "buyer");
        assert_eq!(trees[0].expansions[0].children.len(), 1);
        assert_eq!(trees[0].expansions[0].children[0].name, "manager");
    }

    #[test]
    fn test_find_typed_objects_matches_nested_and_listed() {
        let body = vmap! {
            "ticket" => vmap! { "_type" => "ticket", "buyer_id" => "u1" },
            "related" => soarpc_common::vlist![
                vmap! { "_type" => "ticket", "buyer_id" => "u2" },
                vmap! { "_type" => "other" },
            ],
        };
        let mut prefix = Vec::new();
        let mut found = Vec::new();
        find_typed_objects(&body, "ticket", &mut prefix, &mut found);
        assert_eq!(found.len(), 2);
        assert_eq!(
            value_at_path(&body, &found[0])
                .and_then(|o| o.get("buyer_id"))
                .and_then(Value::as_str),
            Some("u1")
        );
    }

    #[test]
    fn test_value_at_path_mut_allows_splicing() {
        let mut body = vmap! { "items" => soarpc_common::vlist![vmap! { "n" => 1 }] };
        let path = vec![PathSegment::Key("items".to_owned()), PathSegment::Index(0)];
        let object = value_at_path_mut(&mut body, &path).and_then(Value::as_map_mut).unwrap();
        object.insert("spliced".to_owned(), Value::Bool(true));
        assert_eq!(
            value_at_path(&body, &path).and_then(|o| o.get("spliced")),
            Some(&Value::Bool(true))
        );
    }
}
