//! Bamboo error types.

use std::sync::Arc;

/// Shared cause of a [BambooError], if it has one.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Wrap a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// Errors reported across the collaborator seams of a bamboo node.
///
/// Decoding and authentication failures describe why bytes from a peer
/// were dropped. Config and transport failures carry their cause. The
/// node modules wrap this type in their own error enums.
///
/// This type is `Clone` so that results can be shared between the
/// waiters of a single storage operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BambooError {
    /// Bytes from a peer or from storage are not a valid encoding.
    #[error("decode {what}: {reason}")]
    Decode {
        /// The structure being decoded.
        what: Arc<str>,
        /// What was wrong with it.
        reason: Arc<str>,
    },

    /// A datagram failed message authentication.
    #[error("unauthenticated datagram: {0}")]
    Unauthenticated(Arc<str>),

    /// A configuration could not be read or holds an unusable value.
    #[error("config: {ctx} (src: {src})")]
    Config {
        /// The file, section or value involved.
        ctx: Arc<str>,
        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// The transport could not be set up or has stopped.
    #[error("transport: {ctx} (src: {src})")]
    Transport {
        /// The transport operation that failed.
        ctx: Arc<str>,
        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// Any other failure, such as a router with no route.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,
        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },
}

fn arc_str<C: std::fmt::Display>(c: C) -> Arc<str> {
    c.to_string().into_boxed_str().into()
}

impl BambooError {
    /// A decoding failure of `what`.
    pub fn decode<W: std::fmt::Display, R: std::fmt::Display>(
        what: W,
        reason: R,
    ) -> Self {
        Self::Decode {
            what: arc_str(what),
            reason: arc_str(reason),
        }
    }

    /// A datagram whose MAC is missing or wrong.
    pub fn unauthenticated<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Unauthenticated(arc_str(ctx))
    }

    /// An unusable configuration value.
    pub fn config<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Config {
            ctx: arc_str(ctx),
            src: DynInnerError::default(),
        }
    }

    /// A configuration failure with an inner source error.
    pub fn config_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Config {
            ctx: arc_str(ctx),
            src: DynInnerError::new(src),
        }
    }

    /// A transport failure with an inner source error.
    pub fn transport_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Transport {
            ctx: arc_str(ctx),
            src: DynInnerError::new(src),
        }
    }

    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            ctx: arc_str(ctx),
            src: DynInnerError::new(src),
        }
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other {
            ctx: arc_str(ctx),
            src: DynInnerError::default(),
        }
    }
}

/// Result type of the collaborator seams.
pub type BambooResult<T> = Result<T, BambooError>;
