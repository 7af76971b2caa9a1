use serde_json::{Map, Value};

use crate::tool::{ParamSchema, ToolSchema};
use crate::types::McpError;

impl ToolSchema {
    /// Check arguments against the declared parameters and fill defaults.
    ///
    /// Arguments the schema does not mention are passed through untouched.
    pub fn prepare_arguments(&self, mut args: Map<String, Value>) -> Result<Map<String, Value>, McpError> {
        for param in &self.parameters {
            match args.get(&param.name) {
                Some(value) => check_type(param, value)?,
                None if param.required => {
                    return Err(McpError::InvalidParams(format!(
                        "missing required argument \"{}\"",
                        param.name
                    )));
                }
                None => {
                    if let Some(default) = &param.default {
                        args.insert(param.name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(args)
    }
}

/// Unknown type tags are not checked.
fn check_type(param: &ParamSchema, value: &Value) -> Result<(), McpError> {
    let ok = match param.param_type.as_str() {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(McpError::InvalidParams(format!(
            "argument \"{}\" must be of type {}",
            param.name, param.param_type
        )))
    }
}
