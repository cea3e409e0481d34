//! One-shot `set` handling.

use std::sync::Arc;

use log::warn;

use crate::app::ports::Node;
use crate::error::{DsError, ErrorKind};
use crate::rpc::frame::{closed_response, error_response};
use crate::rpc::guard::shielded_call;
use crate::rpc::permission::{self, Permission};
use crate::rpc::value::Value;

use super::ResponderCore;

pub(crate) fn handle(
    core: &Arc<ResponderCore>,
    rid: u32,
    node: &dyn Node,
    request: &Value,
    granted: Permission,
) {
    let result = apply(node, request, granted);
    match result {
        Ok(()) => core.send(closed_response(rid)),
        Err(e) => {
            warn!("RESP[{}]: set rejected: {}", rid, e);
            core.send(error_response(rid, &e));
        }
    }
}

fn apply(node: &dyn Node, request: &Value, granted: Permission) -> Result<(), DsError> {
    let value = request
        .get("value")
        .cloned()
        .ok_or_else(|| DsError::new(ErrorKind::InvalidValue, "missing value"))?;
    let required = node
        .info()
        .writable
        .ok_or_else(|| DsError::not_implemented("set"))?;
    let permit = request
        .get("permit")
        .and_then(Value::as_str)
        .and_then(Permission::parse);
    if !permission::has_permission(required, permission::effective(granted, permit)) {
        return Err(DsError::permission_denied());
    }
    shielded_call(|| node.set_value(value)).map_err(DsError::server)?
}
