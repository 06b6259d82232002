//! Statically declared RPC service contracts
//!
//! A [`ServiceDescriptor`] is the method table of a gRPC service. It is built
//! once, at compile time, and shared by every wrapper that forwards calls to
//! the service (the fault-detecting caller, the polling proxy and any test
//! doubles). [`ServiceContract`] binds a concrete client type to its
//! descriptor and tells the transport layer how to build the client over a
//! fresh [`Channel`].

use std::fmt;
use tonic::transport::Channel;

/// Method table of a gRPC service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Fully qualified service name (`package.Service`)
    pub name: &'static str,

    /// Names of the unary and streaming methods the service exposes
    pub methods: &'static [&'static str],
}

impl ServiceDescriptor {
    /// Check whether `method` is part of this contract
    pub fn contains(&self, method: &str) -> bool {
        self.methods.iter().any(|m| *m == method)
    }

    /// Iterate over the method names in declaration order
    pub fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.iter().copied()
    }

    /// gRPC path for a method, e.g. `/fmaas.GenerationService/Generate`
    pub fn path(&self, method: &str) -> Option<String> {
        self.contains(method)
            .then(|| format!("/{}/{}", self.name, method))
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Method table of the TGIS text generation service
pub const GENERATION_SERVICE: ServiceDescriptor = ServiceDescriptor {
    name: "fmaas.GenerationService",
    methods: &["Generate", "GenerateStream", "Tokenize", "ModelInfo"],
};

/// A client type bound to a service contract
///
/// Implement this for generated tonic clients, e.g.
/// `GenerationServiceClient<Channel>`, by returning `Client::new(channel)`.
/// Clients must be cheap to clone: tonic clients are thin wrappers around a
/// reference-counted channel.
pub trait ServiceContract: Clone + Send + Sync + 'static {
    /// The method table this client implements
    const DESCRIPTOR: ServiceDescriptor;

    /// Build a client over a channel
    fn from_channel(channel: Channel) -> Self;
}

/// Untyped binding to the generation service
///
/// Holds only the channel. Useful where the process needs to be kept alive
/// and reachable but the caller drives the wire protocol itself, e.g. with
/// `tonic::client::Grpc::new(binding.channel())`.
#[derive(Debug, Clone)]
pub struct GenerationChannel {
    channel: Channel,
}

impl GenerationChannel {
    /// The channel calls are sent over
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

impl ServiceContract for GenerationChannel {
    const DESCRIPTOR: ServiceDescriptor = GENERATION_SERVICE;

    fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_lookup() {
        assert!(GENERATION_SERVICE.contains("Generate"));
        assert!(GENERATION_SERVICE.contains("Tokenize"));
        assert!(!GENERATION_SERVICE.contains("generate"));
        assert!(!GENERATION_SERVICE.contains("Shutdown"));
    }

    #[test]
    fn test_descriptor_paths() {
        assert_eq!(
            GENERATION_SERVICE.path("ModelInfo").as_deref(),
            Some("/fmaas.GenerationService/ModelInfo")
        );
        assert_eq!(GENERATION_SERVICE.path("Missing"), None);
    }

    #[test]
    fn test_method_names_keep_declaration_order() {
        let names: Vec<_> = GENERATION_SERVICE.method_names().collect();
        assert_eq!(names, vec!["Generate", "GenerateStream", "Tokenize", "ModelInfo"]);
        assert_eq!(GENERATION_SERVICE.to_string(), "fmaas.GenerationService");
    }

    #[tokio::test]
    async fn test_generation_channel_binding() {
        let channel = tonic::transport::Endpoint::from_static("http://127.0.0.1:50055")
            .connect_lazy();
        let binding = GenerationChannel::from_channel(channel);
        let _cloned = binding.clone().channel();
        assert_eq!(GenerationChannel::DESCRIPTOR, GENERATION_SERVICE);
    }
}
