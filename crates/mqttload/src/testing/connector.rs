use super::broker::LoopbackBroker;
use crate::transport::{Connector, Transport};
use mqttload_protocol::{HarnessError, Packet, Result};
use tokio::sync::mpsc;

/// Client end of a loopback connection.
#[derive(Debug)]
pub struct LoopbackTransport {
    to_broker: Option<mpsc::UnboundedSender<Packet>>,
    from_broker: mpsc::UnboundedReceiver<Packet>,
}

impl LoopbackTransport {
    pub(crate) fn new(
        to_broker: mpsc::UnboundedSender<Packet>,
        from_broker: mpsc::UnboundedReceiver<Packet>,
    ) -> Self {
        Self {
            to_broker: Some(to_broker),
            from_broker,
        }
    }
}

impl Transport for LoopbackTransport {
    async fn send(&mut self, packet: Packet) -> Result<()> {
        let Some(tx) = &self.to_broker else {
            return Err(HarnessError::Transport("transport closed".to_string()));
        };
        tx.send(packet)
            .map_err(|_| HarnessError::Transport("loopback broker went away".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Packet>> {
        Ok(self.from_broker.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.to_broker = None;
        self.from_broker.close();
        Ok(())
    }
}

/// Opens loopback connections to one broker; the endpoint is ignored.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    broker: LoopbackBroker,
}

impl LoopbackConnector {
    #[must_use]
    pub fn new(broker: LoopbackBroker) -> Self {
        Self { broker }
    }

    #[must_use]
    pub fn broker(&self) -> &LoopbackBroker {
        &self.broker
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn open(&self, _endpoint: &str) -> Result<LoopbackTransport> {
        Ok(self.broker.accept())
    }
}
