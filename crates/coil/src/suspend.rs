//! The suspend/resume protocol shared by generators and coroutines.
//!
//! A generator or coroutine object is a [`Suspendable`]: a handle to a body
//! context parked in the VM's arena plus its [`SuspendKind`]. Resuming it
//! (`start_send` / `start_next`) links the resumer in as the body's caller and
//! returns the body's id for the dispatch loop to drive. The body hands control
//! back with `YieldValue`, or by finishing, which surfaces to the resumer as
//! `StopIteration`.
//!
//! ```text
//! unstarted --send(None)--> parked --send(v)--> parked --return/raise--> terminated
//! ```
//!
//! Generators and coroutines share this state machine; the kind only affects
//! naming in errors and `type_name`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use strum::Display;
use tracing::debug;

use crate::context::{ContextId, Contexts};
use crate::error::{Error, Result};
use crate::exception::{ExcType, Exception};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SuspendKind {
    Generator,
    Coroutine,
}

/// Bodies whose last handle has been dropped, waiting for their VM to
/// release them.
#[derive(Debug, Clone, Default)]
pub(crate) struct Abandoned(Arc<Mutex<Vec<ContextId>>>);

impl Abandoned {
    pub(crate) fn take(&self) -> Vec<ContextId> {
        std::mem::take(&mut *self.0.lock())
    }

    pub(crate) fn extend(&self, ids: impl IntoIterator<Item = ContextId>) {
        self.0.lock().extend(ids);
    }
}

/// Shared by every clone of one handle. Dropping the last clone reports the
/// body as abandoned.
struct Liveness {
    context: ContextId,
    abandoned: Abandoned,
}

impl Drop for Liveness {
    fn drop(&mut self) {
        self.abandoned.0.lock().push(self.context);
    }
}

/// A generator or coroutine object.
///
/// Handles are reference counted: clones refer to the same body, and once
/// the last one is dropped the VM releases the body the next time it
/// dispatches.
#[derive(Clone)]
pub struct Suspendable {
    context: ContextId,
    kind: SuspendKind,
    liveness: Arc<Liveness>,
}

impl Suspendable {
    pub(crate) fn new(context: ContextId, kind: SuspendKind, abandoned: &Abandoned) -> Self {
        Self {
            context,
            kind,
            liveness: Arc::new(Liveness {
                context,
                abandoned: abandoned.clone(),
            }),
        }
    }

    /// The wrapped body context.
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn kind(&self) -> SuspendKind {
        self.kind
    }

    /// Resume the body with `value`, making `calling` its caller.
    ///
    /// An unstarted body only accepts [`Value::None`] and begins at its first
    /// instruction; any other value fails with [`Error::InvalidSend`]. A parked
    /// body receives `value` on its data stack and continues after the yield it
    /// is parked at. A finished (or released) body raises `StopIteration`, and
    /// a body that is already running in `calling`'s chain raises `ValueError`.
    ///
    /// `origin` and `origin_line` identify the resumption site for logging.
    pub fn start_send(
        &self,
        contexts: &mut Contexts,
        value: Value,
        calling: ContextId,
        origin: &str,
        origin_line: Option<u32>,
    ) -> Result<ContextId> {
        let depth = contexts.get(calling)?.depth() + 1;
        if contexts.chain_contains(calling, self.context) {
            return Err(Exception::raised(
                ExcType::ValueError,
                format!("{} already executing", self.kind),
            )
            .into());
        }
        let Ok(body) = contexts.get_mut(self.context) else {
            return Err(Exception::stop_iteration().into());
        };
        if body.is_terminated() {
            return Err(Exception::stop_iteration().into());
        }

        if body.is_unstarted() && !value.is_none() {
            return Err(Error::InvalidSend {
                kind: self.kind,
                value_type: value.type_name(),
            });
        }

        body.set_caller(Some(calling));
        body.set_depth(depth);
        if body.is_unstarted() {
            body.set_ip(0);
            debug!(
                kind = %self.kind,
                body = body.name(),
                origin,
                line = ?origin_line,
                "starting suspended body"
            );
        } else {
            debug!(
                kind = %self.kind,
                body = body.name(),
                ip = body.ip(),
                origin,
                line = ?origin_line,
                "resuming suspended body"
            );
            body.push(value);
        }
        Ok(self.context)
    }

    /// Resume for plain iteration: `start_send` with [`Value::None`].
    pub fn start_next(
        &self,
        contexts: &mut Contexts,
        calling: ContextId,
        origin: &str,
        origin_line: Option<u32>,
    ) -> Result<ContextId> {
        self.start_send(contexts, Value::None, calling, origin, origin_line)
    }
}

impl PartialEq for Suspendable {
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context && self.kind == other.kind
    }
}

impl Eq for Suspendable {}

impl Hash for Suspendable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.context.hash(state);
        self.kind.hash(state);
    }
}

impl fmt::Debug for Suspendable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspendable")
            .field("context", &self.context)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
