//! Top-level job request validation.
//!
//! This is the shape check applied before any dispatch: the body must be a
//! map with a non-empty `actions` list of named actions. Action body
//! contents are the business of per-action validators; this only rejects
//! structurally unusable jobs.

use soarpc_common::{Error, Value};

fn structure_error(message: &str, field: &str) -> Error {
    // A structurally invalid job means the sending library is buggy, not
    // the calling user.
    Error::new("INVALID", message).with_field(field)
}

/// Validates the top-level shape of a job request body. Returns job-level
/// errors; an empty list means the job may be dispatched.
pub fn validate_job_request(body: &Value) -> Vec<Error> {
    let Some(map) = body.as_map() else {
        return vec![structure_error("job request is not a map", "")];
    };

    let mut errors = Vec::new();

    match map.get("actions") {
        Some(Value::List(actions)) => {
            if actions.is_empty() {
                errors.push(structure_error("actions must not be empty", "actions"));
            }
            for (index, action) in actions.iter().enumerate() {
                let field = format!("actions.{}", index);
                match action.as_map() {
                    Some(action_map) => {
                        let name = action_map.get("action").and_then(Value::as_str);
                        if name.map_or(true, str::is_empty) {
                            errors.push(structure_error(
                                "action name is required",
                                &format!("{}.action", field),
                            ));
                        }
                    }
                    None => errors.push(structure_error("action is not a map", &field)),
                }
            }
        }
        Some(_) => errors.push(structure_error("actions must be a list", "actions")),
        None => errors.push(structure_error("actions are required", "actions")),
    }

    if let Some(context) = map.get("context") {
        if context.as_map().is_none() {
            errors.push(structure_error("context must be a map", "context"));
        }
    }
    if let Some(control) = map.get("control") {
        if control.as_map().is_none() {
            errors.push(structure_error("control must be a map", "control"));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use soarpc_common::{vlist, vmap};

    #[test]
    fn test_valid_job_passes() {
        let body = vmap! {
            "actions" => vlist![vmap! { "action" => "square", "body" => vmap! {} }],
            "context" => vmap! { "correlation_id" => "abc" },
            "control" => vmap! {},
        };
        assert!(validate_job_request(&body).is_empty());
    }

    #[test]
    fn test_zero_actions_is_a_validation_error() {
        let body = vmap! { "actions" => vlist![] };
        let errors = validate_job_request(&body);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field.as_deref(), Some("actions"));
    }

    #[test]
    fn test_missing_action_name_is_located_by_index() {
        let body = vmap! {
            "actions" => vlist![
                vmap! { "action" => "ok" },
                vmap! { "body" => vmap! {} },
            ],
        };
        let errors = validate_job_request(&body);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field.as_deref(), Some("actions.1.action"));
    }

    #[test]
    fn test_non_map_job_is_rejected() {
        assert!(!validate_job_request(&Value::Int(3)).is_empty());
    }
}
