//! Request-builder helpers for the outbound side of the endpoint:
//! registration, bootstrap, and blockwise download all start from one
//! of these instead of hand-assembling a `Message`.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::message::{Code, Message, MessageType};
use crate::options::{BlockValue, MediaType, OptionNumber};
use crate::transport::{Endpoint, TransportError};

/// A confirmable request under construction, finished with `send`.
pub struct RequestBuilder {
    message: Message,
}

impl RequestBuilder {
    pub fn new(endpoint: &Endpoint, code: Code, path: &str) -> RequestBuilder {
        let mut message = Message::new(MessageType::Confirmable, code, endpoint.next_message_id())
            .with_token(endpoint.next_token());
        message.options.push_uri_path(path);
        RequestBuilder { message }
    }

    pub fn query(mut self, query: &str) -> RequestBuilder {
        self.message.options.push_uri_query(query);
        self
    }

    pub fn content_format(mut self, format: MediaType) -> RequestBuilder {
        self.message.options.push_uint(OptionNumber::ContentFormat, format.code() as u32);
        self
    }

    pub fn accept(mut self, format: MediaType) -> RequestBuilder {
        self.message.options.push_uint(OptionNumber::Accept, format.code() as u32);
        self
    }

    pub fn observe(mut self) -> RequestBuilder {
        self.message.options.push_uint(OptionNumber::Observe, 0);
        self
    }

    pub fn block1(mut self, block: BlockValue) -> RequestBuilder {
        self.message.options.push_block1(block);
        self
    }

    pub fn block2(mut self, block: BlockValue) -> RequestBuilder {
        self.message.options.push_block2(block);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> RequestBuilder {
        self.message.payload = payload;
        self
    }

    pub fn token(&self) -> &[u8] {
        &self.message.token
    }

    pub async fn send(self, endpoint: &Arc<Endpoint>, peer: SocketAddr) -> Result<Message, TransportError> {
        endpoint.request(self.message, peer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builder_assembles_expected_options() {
        let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let builder = RequestBuilder::new(&endpoint, Code::POST, "rd")
            .query("ep=urn:imei:123")
            .query("lt=86400")
            .content_format(MediaType::LinkFormat);
        assert_eq!(builder.message.options.uri_path(), vec!["rd".to_string()]);
        assert_eq!(
            builder.message.options.uri_query(),
            vec!["ep=urn:imei:123".to_string(), "lt=86400".to_string()]
        );
        assert_eq!(builder.message.options.content_format(), Some(MediaType::LinkFormat.code()));
    }
}
