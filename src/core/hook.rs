//! Lifecycle hooks.
//!
//! Tasks expose three extension points: `on_render`, `on_finish` and
//! `on_failure`. A hook declares up front which arguments it wants, drawn
//! from the fixed set `{task, client, product, params}`; an unknown name
//! is rejected when the hook is attached, not when it fires. At call time
//! the engine fills exactly the declared subset of [`HookArgs`] from the
//! current runtime values and leaves the rest empty.

use std::fmt;
use std::str::FromStr;

use super::client::Client;
use super::params::Params;
use super::product::Product;
use super::status::TaskStatus;
use super::task::{ConfigError, RunError};
use super::types::TaskName;

/// Argument names a hook may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookParam {
    Task,
    Client,
    Product,
    Params,
}

impl HookParam {
    pub fn as_str(self) -> &'static str {
        match self {
            HookParam::Task => "task",
            HookParam::Client => "client",
            HookParam::Product => "product",
            HookParam::Params => "params",
        }
    }
}

impl FromStr for HookParam {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(HookParam::Task),
            "client" => Ok(HookParam::Client),
            "product" => Ok(HookParam::Product),
            "params" => Ok(HookParam::Params),
            other => Err(other.to_string()),
        }
    }
}

/// Lightweight view of the task a hook fires on.
#[derive(Debug, Clone, Copy)]
pub struct TaskView<'a> {
    pub name: &'a TaskName,
    pub status: TaskStatus,
}

/// Arguments handed to a hook: only the declared subset is filled.
#[derive(Default)]
pub struct HookArgs<'a> {
    pub task: Option<TaskView<'a>>,
    pub client: Option<&'a dyn Client>,
    pub product: Option<&'a dyn Product>,
    pub params: Option<&'a Params>,
}

/// Everything the engine has available when a hook fires. The hook's
/// declared parameter list selects what actually gets passed.
pub struct HookContext<'a> {
    pub task: TaskView<'a>,
    pub client: Option<&'a dyn Client>,
    pub product: Option<&'a dyn Product>,
    pub params: Option<&'a Params>,
}

type HookFn = Box<dyn Fn(&HookArgs<'_>) -> Result<(), RunError> + Send + Sync>;

/// A validated lifecycle callback.
pub struct Hook {
    wants: Vec<HookParam>,
    func: HookFn,
}

impl Hook {
    /// Attach-time construction: every declared name must belong to the
    /// fixed set, otherwise this fails immediately with a
    /// [`ConfigError::UnknownHookParam`].
    pub fn new<F>(declared: &[&str], func: F) -> Result<Self, ConfigError>
    where
        F: Fn(&HookArgs<'_>) -> Result<(), RunError> + Send + Sync + 'static,
    {
        let mut wants = Vec::with_capacity(declared.len());
        for name in declared {
            let param = name
                .parse::<HookParam>()
                .map_err(|unknown| ConfigError::UnknownHookParam { param: unknown })?;
            if !wants.contains(&param) {
                wants.push(param);
            }
        }
        Ok(Self {
            wants,
            func: Box::new(func),
        })
    }

    /// The declared argument names, in declaration order.
    pub fn declared(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.wants.iter().map(|p| p.as_str())
    }

    /// Fire the hook with exactly the declared subset of the context.
    ///
    /// Values are taken from the context at call time, so a product or
    /// params that changed since attachment is seen in its current form.
    pub fn invoke(&self, ctx: &HookContext<'_>) -> Result<(), RunError> {
        let mut args = HookArgs::default();
        for param in &self.wants {
            match param {
                HookParam::Task => args.task = Some(ctx.task),
                HookParam::Client => args.client = ctx.client,
                HookParam::Product => args.product = ctx.product,
                HookParam::Params => args.params = ctx.params,
            }
        }
        (self.func)(&args)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("wants", &self.wants)
            .finish_non_exhaustive()
    }
}
