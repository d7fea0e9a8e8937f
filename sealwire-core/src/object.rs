//! Uniform object handle.
//!
//! Callers that do not care which variant they hold drive a
//! [`CryptObject`] through [`Transform`] and the attribute calls; both
//! dispatch to the session or envelope underneath.

use std::fmt;

use crate::attribute::{Attribute, Handle};
use crate::buffer::AttributeSource;
use crate::context::Context;
use crate::credential::ResourceKind;
use crate::envelope::{Envelope, EnvelopeMode};
use crate::error::Result;
use crate::fault::FaultController;
use crate::session::{Role, Session};
use crate::stream::Transform;
use crate::transport::Transport;

/// What to create.
pub enum ObjectKind {
    /// Envelope in the given direction.
    Envelope(EnvelopeMode),
    /// Session in the given role over a transport.
    Session(Role, Box<dyn Transport>),
}

impl fmt::Debug for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope(mode) => f.debug_tuple("Envelope").field(mode).finish(),
            Self::Session(role, _) => f.debug_tuple("Session").field(role).finish(),
        }
    }
}

/// A session or an envelope.
#[derive(Debug)]
pub enum CryptObject {
    /// Envelope variant.
    Envelope(Envelope),
    /// Session variant.
    Session(Session),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $call:expr) => {
        match $self {
            CryptObject::Envelope($inner) => $call,
            CryptObject::Session($inner) => $call,
        }
    };
}

impl CryptObject {
    /// Create an object from `ctx`.
    pub fn create(ctx: &Context, kind: ObjectKind) -> Result<Self> {
        match kind {
            ObjectKind::Envelope(mode) => ctx.create_envelope(mode).map(Self::Envelope),
            ObjectKind::Session(role, transport) => {
                ctx.create_session_boxed(role, transport).map(Self::Session)
            }
        }
    }

    /// Destroy the object, wiping everything it holds.
    pub fn destroy(self) {
        dispatch!(self, inner => inner.destroy());
    }

    /// The envelope, if this is one.
    pub fn as_envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Envelope(envelope) => Some(envelope),
            Self::Session(_) => None,
        }
    }

    /// The session, if this is one.
    pub fn as_session(&self) -> Option<&Session> {
        match self {
            Self::Session(session) => Some(session),
            Self::Envelope(_) => None,
        }
    }

    /// Set a numeric attribute.
    pub fn set_numeric(&mut self, attr: Attribute, value: i64) -> Result<()> {
        dispatch!(self, inner => inner.set_numeric(attr, value))
    }

    /// Read a numeric attribute.
    pub fn get_numeric(&self, attr: Attribute) -> Result<i64> {
        dispatch!(self, inner => inner.get_numeric(attr))
    }

    /// Set a text attribute.
    pub fn set_string(&mut self, attr: Attribute, value: &str) -> Result<()> {
        dispatch!(self, inner => inner.set_string(attr, value))
    }

    /// Read a text attribute.
    pub fn get_string(&self, attr: Attribute) -> Result<String> {
        dispatch!(self, inner => inner.get_string(attr))
    }

    /// Set a handle attribute.
    pub fn set_handle(&mut self, attr: Attribute, handle: Handle) -> Result<()> {
        dispatch!(self, inner => inner.set_handle(attr, handle))
    }
}

impl Transform for CryptObject {
    fn push(&mut self, data: &[u8]) -> Result<usize> {
        dispatch!(self, inner => inner.push(data))
    }

    fn flush(&mut self) -> Result<()> {
        dispatch!(self, inner => inner.flush())
    }

    fn pop(&mut self, out: &mut [u8]) -> Result<usize> {
        dispatch!(self, inner => inner.pop(out))
    }

    fn required_resource(&self) -> Option<ResourceKind> {
        dispatch!(self, inner => inner.required_resource())
    }

    fn last_error(&self) -> Option<&str> {
        dispatch!(self, inner => inner.last_error())
    }
}

impl AttributeSource for CryptObject {
    fn read_attribute(&self, attr: Attribute, out: Option<&mut [u8]>) -> Result<usize> {
        dispatch!(self, inner => inner.read_attribute(attr, out))
    }

    fn fault_controller(&self) -> Option<&FaultController> {
        dispatch!(self, inner => inner.fault_controller())
    }
}
