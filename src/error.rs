// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Engine-wide error types and output stop codes.

use thiserror::Error;

/// Why an output stopped. Carried by the `stop` signal together with the
/// last error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StopCode {
    /// Clean stop requested by the user.
    Success = 0,
    /// The transport lost its connection.
    Disconnected = -1,
    /// The destination rejected the stream as malformed.
    InvalidStream = -2,
    /// Any other terminal failure.
    Error = -3,
}

impl StopCode {
    /// Integer code carried on the stop signal.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Top-level error aggregating the per-module error types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration loading/validation failure.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    /// Encoder lifecycle or codec failure.
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    /// Output lifecycle failure.
    #[error(transparent)]
    Output(#[from] OutputError),
    /// Scene graph operation failure.
    #[error(transparent)]
    Scene(#[from] SceneError),
}

/// Errors from the encoder pipeline.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// No codec factory registered under the requested id.
    #[error("unknown codec id '{0}'")]
    UnknownCodec(String),
    /// The factory kind does not match the encoder kind.
    #[error("codec '{0}' is not a {1} codec")]
    WrongKind(String, &'static str),
    /// Codec state could not be created.
    #[error("codec initialization failed: {0}")]
    InitFailed(#[from] cindercast_plugin_api::CodecError),
    /// The encoder has no media source bound.
    #[error("encoder '{0}' has no media bound")]
    NoMedia(String),
    /// Operation requires an inactive encoder.
    #[error("encoder '{0}' is active")]
    Active(String),
}

/// Errors from output start/stop and the interleaver.
#[derive(Debug, Error)]
pub enum OutputError {
    /// The output is missing an encoder it was declared to use.
    #[error("output '{0}' is missing a required encoder")]
    MissingEncoder(String),
    /// An encoder failed to initialize; the message is its last error.
    #[error("encoder initialization failed: {0}")]
    EncoderInit(String),
    /// The output backend failed to start.
    #[error("output start failed: {0}")]
    StartFailed(#[from] cindercast_plugin_api::OutputImplError),
    /// Operation requires an active output.
    #[error("output '{0}' is not active")]
    NotActive(String),
    /// Operation is not supported by this output's kind mask.
    #[error("output '{0}' does not support {1}")]
    Unsupported(String, &'static str),
}

/// Errors from scene graph mutation.
#[derive(Debug, Error)]
pub enum SceneError {
    /// Adding the source would create a cycle in the graph.
    #[error("adding '{0}' would create a scene cycle")]
    WouldRecurse(String),
    /// The referenced item is not part of this scene.
    #[error("scene item not found")]
    ItemNotFound,
    /// The source kind cannot be added here (e.g. a scene into a group).
    #[error("source '{0}' cannot be added: {1}")]
    InvalidChild(String, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_codes_are_stable() {
        assert_eq!(StopCode::Success.code(), 0);
        assert_eq!(StopCode::Disconnected.code(), -1);
        assert_eq!(StopCode::InvalidStream.code(), -2);
        assert_eq!(StopCode::Error.code(), -3);
    }
}
