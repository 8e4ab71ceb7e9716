//! Sandboxed predicate evaluation for output filtering.
//!
//! Each pipe may carry named Lua predicates; for every stdout line the
//! executor evaluates them with the line bound to the global `output`.
//! A predicate evaluating truthy excludes the line. One VM is reused
//! across all lines of a job but never shared between jobs.

use mlua::{Lua, LuaOptions, StdLib, Value as LuaValue};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter evaluation failed: {0}")]
    Lua(#[from] mlua::Error),
}

pub struct FilterVm {
    lua: Lua,
}

impl FilterVm {
    /// Creates a VM restricted to the table, string and math libraries.
    pub fn new() -> Result<Self, FilterError> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::default(),
        )?;
        Ok(Self { lua })
    }

    /// Evaluates one predicate against one line. Lua truthiness applies:
    /// `nil` and `false` do not match, everything else does.
    pub fn matches(&self, script: &str, output: &str) -> Result<bool, FilterError> {
        self.lua.globals().set("output", output)?;
        let value = self.lua.load(script).eval::<LuaValue>()?;
        Ok(match value {
            LuaValue::Nil => false,
            LuaValue::Boolean(b) => b,
            _ => true,
        })
    }
}
