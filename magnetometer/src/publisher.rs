//! Sink for encoded records.

use hardware::mqtt::{MqttClient, MqttResult, QoS};

/// Publish/subscribe transport used by the acquisition loop.
///
/// Implemented by [`MqttClient`]; tests substitute an in-memory recorder.
pub trait Publisher {
    /// Run one non-blocking iteration of broker I/O, reconnecting if needed.
    ///
    /// Returns an error only for failures that retrying cannot fix.
    fn pump(&mut self) -> MqttResult<()>;

    /// Queue `payload` for `topic`.
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()>;

    /// Disconnect and release the socket. Must be idempotent.
    fn close(&mut self);
}

impl Publisher for MqttClient {
    fn pump(&mut self) -> MqttResult<()> {
        self.sync()
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        MqttClient::publish(self, topic, payload, qos)
    }

    fn close(&mut self) {
        MqttClient::close(self)
    }
}

impl<P: Publisher + ?Sized> Publisher for &mut P {
    fn pump(&mut self) -> MqttResult<()> {
        (**self).pump()
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        (**self).publish(topic, payload, qos)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
