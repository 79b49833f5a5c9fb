//! Sends one message through a queue and reads it back with a subscriber.
//!
//! ```text
//! cargo run -p mskit-messaging-rabbitmq --example roundtrip -- service.json
//! ```
//!
//! The file needs an `amqp` section; `MSKIT_AMQP__*` variables override it.
use std::sync::Arc;
use std::time::Duration;

use mskit_messaging_core::{
    load_config, logging, AmqpConfig, Delivery, Message, MessageHandler, MessagingError,
    SubscribeOptions, DEFAULT_PRIORITY,
};
use mskit_messaging_rabbitmq::{amqp_service, RabbitMqOptions};
use tracing::info;

const QUEUE: &str = "mskit.demo";

struct PrintHandler;

#[async_trait::async_trait]
impl MessageHandler for PrintHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<bool, MessagingError> {
        let message = Message::try_from(delivery.data.as_slice())?;
        info!(action = %message.action, payload = %message.payload, "received");
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("info", Default::default())?;

    let path = std::env::args().nth(1).unwrap_or_else(|| "service.json".into());
    let config: AmqpConfig = load_config(&path, "amqp")?;

    let amqp = amqp_service(config, RabbitMqOptions::default());
    if !amqp.init().await {
        return Err("could not connect to the broker".into());
    }

    amqp.create_queue(QUEUE, None).await?;
    let message = Message::new("greet", serde_json::json!({ "text": "hello" }))
        .with_initiator("roundtrip");
    amqp.send_to_queue(QUEUE, &message, DEFAULT_PRIORITY).await?;
    info!(length = amqp.get_queue_length(QUEUE).await?, "queued");

    let sub = amqp
        .subscribe("", "", QUEUE, Arc::new(PrintHandler), SubscribeOptions::default())
        .await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    sub.cancel().await;
    amqp.remove_queue(QUEUE).await?;
    amqp.close().await?;
    Ok(())
}
