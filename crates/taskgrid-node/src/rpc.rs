use std::fmt::Debug;

/// The address of a worker service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub enable_tls: bool,
    pub host: String,
    pub port: u16,
}

impl ClientOptions {
    pub fn to_url_string(&self) -> String {
        let scheme = if self.enable_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// An opaque capability for sending task submissions to a worker process.
/// The communication layer constructs the connection once a worker is
/// assigned; the wire protocol is not this crate's concern.
pub trait WorkerConnection: Debug + Send + 'static {
    fn options(&self) -> &ClientOptions;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_options_url() {
        let options = ClientOptions {
            enable_tls: false,
            host: "127.0.0.1".to_string(),
            port: 1234,
        };
        assert_eq!(options.to_url_string(), "http://127.0.0.1:1234");
        let options = ClientOptions {
            enable_tls: true,
            ..options
        };
        assert_eq!(options.to_url_string(), "https://127.0.0.1:1234");
    }
}
