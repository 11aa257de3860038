//! Test server configuration.
//!
//! Options can be built in code with the `with_*` methods or loaded from a
//! TOML file:
//!
//! ```toml
//! allow_synchronous_io = false
//! preserve_execution_context = true
//! base_address = "http://localhost/api/"
//! request_buffer_size = 65536
//! response_buffer_size = 65536
//! ```

use std::path::Path;

use http::Uri;
use serde::{Deserialize, Serialize};
use warpgrid_exchange::DEFAULT_PIPE_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestServerOptions {
    /// Permit blocking body reads and writes from the application.
    pub allow_synchronous_io: bool,
    /// Flow the client request's extensions into the application's
    /// execution context.
    pub preserve_execution_context: bool,
    /// Base for relative request URIs. Its path becomes the path base of
    /// requests below it.
    #[serde(with = "uri_serde")]
    pub base_address: Uri,
    /// Request body pipe capacity in bytes.
    pub request_buffer_size: usize,
    /// Response body pipe capacity in bytes.
    pub response_buffer_size: usize,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            allow_synchronous_io: false,
            preserve_execution_context: false,
            base_address: Uri::from_static("http://localhost/"),
            request_buffer_size: DEFAULT_PIPE_CAPACITY,
            response_buffer_size: DEFAULT_PIPE_CAPACITY,
        }
    }
}

impl TestServerOptions {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let options: TestServerOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn with_allow_synchronous_io(mut self, allow: bool) -> Self {
        self.allow_synchronous_io = allow;
        self
    }

    pub fn with_preserve_execution_context(mut self, preserve: bool) -> Self {
        self.preserve_execution_context = preserve;
        self
    }

    pub fn with_base_address(mut self, base_address: Uri) -> Self {
        self.base_address = base_address;
        self
    }

    pub fn with_request_buffer_size(mut self, size: usize) -> Self {
        self.request_buffer_size = size;
        self
    }

    pub fn with_response_buffer_size(mut self, size: usize) -> Self {
        self.response_buffer_size = size;
        self
    }

    /// The base address path without a trailing slash, e.g. `/api` for
    /// `http://localhost/api/`. Empty for the root.
    pub fn path_base(&self) -> &str {
        self.base_address.path().trim_end_matches('/')
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.base_address.scheme().is_some() && self.base_address.authority().is_some(),
            "base_address must be an absolute URI, got {}",
            self.base_address
        );
        anyhow::ensure!(
            self.request_buffer_size > 0 && self.response_buffer_size > 0,
            "buffer sizes must be greater than zero"
        );
        Ok(())
    }
}

mod uri_serde {
    use http::Uri;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(uri: &Uri, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(uri)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uri, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
