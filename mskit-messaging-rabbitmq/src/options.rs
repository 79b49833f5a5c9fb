use lapin::types::{AMQPValue, FieldTable};

#[derive(Clone, Debug, Default)]
pub struct RabbitMqOptions {
    /// Puts every channel in confirm mode and waits for the broker ACK/NACK on publish.
    pub confirms: bool,
    /// Name shown for the connection in the management UI.
    pub connection_name: Option<String>,
}

/// Queue arguments enabling broker-side priorities.
pub fn priority_args(max_priority: Option<u8>) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(max) = max_priority {
        args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max));
    }
    args
}
