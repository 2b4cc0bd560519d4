//! Generated protobuf code and gRPC service definitions for the compass
//! control plane.
//!
//! The schema lives under `api/proto/compass/v1/` and is compiled by
//! `tonic-build`. Both client and server bindings are generated; the server
//! side exists for in-process test doubles.

#![warn(clippy::all)]

/// Generated protobuf code and gRPC service definitions
pub mod proto {
    /// Compass protocol definitions
    pub mod compass {
        /// Version 1 of the compass protocol
        #[allow(missing_docs)]
        pub mod v1 {
            tonic::include_proto!("compass.v1");
        }
    }
}

pub use proto::compass::v1::*;
