mod options;
mod rabbit_broker;

use std::sync::Arc;

use mskit_messaging_core::{AmqpConfig, AmqpService};

pub use options::{priority_args, RabbitMqOptions};
pub use rabbit_broker::{RabbitBroker, RabbitChannel, RabbitConnection};

/// Builds a service backed by RabbitMQ. Call `init` on it to connect.
pub fn amqp_service(config: AmqpConfig, options: RabbitMqOptions) -> AmqpService {
    AmqpService::new(Arc::new(RabbitBroker::new(options)), config)
}
