//! Proxy node: inserted by the [`super::GraphBuilder`] whenever a second edge would otherwise
//! connect the same ordered pair of tasks, since the graph model allows at most one. A proxy is a
//! pure pass-through — it exists only so the second edge has somewhere distinct to land.

use crate::{error::Result, message::Message};

pub struct ProxyState;

impl ProxyState {
    pub fn process(&self, message: Message) -> Result<Vec<(String, Message)>> {
        Ok(vec![("proxy_out".to_owned(), message)])
    }
}
