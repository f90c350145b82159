//! Sender Demo
//!
//! Connects to an AMQP 1.0 peer, attaches a sender link and sends a batch of
//! messages, waiting until every one of them has been accepted.
//!
//! Run the receiver demo first, then:
//!
//! ```text
//! cargo run --example send -- amqp://127.0.0.1:5672/examples 10
//! ```

use bytes::Bytes;
use dumq_amqp_io::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "amqp://127.0.0.1:5672/examples".to_string());
    let count: u32 = std::env::args()
        .nth(2)
        .and_then(|n| n.parse().ok())
        .unwrap_or(10);

    let address: AmqpAddress = url.parse()?;
    let node = address
        .address
        .clone()
        .unwrap_or_else(|| "examples".to_string());

    println!("sending {} messages to {}", count, address);

    let container = Container::new("send-demo");
    let mut sent = 0u32;
    let mut accepted = 0u32;
    container.connect(&url, move |batch: &mut Batch| {
        while let Some(event) = batch.next() {
            match &event {
                Event::ConnectionRemoteOpen { .. } => {
                    let connection = batch.engine().unwrap().connection();
                    let channel = connection.begin_session().expect("begin session");
                    connection
                        .attach_sender(channel, "send-demo", node.clone())
                        .expect("attach sender");
                }
                Event::LinkFlow { link, credit, .. } => {
                    let connection = batch.engine().unwrap().connection();
                    let mut available = *credit;
                    while sent < count && available > 0 {
                        sent += 1;
                        available -= 1;
                        connection
                            .send(
                                *link,
                                format!("{}", sent).into_bytes(),
                                Bytes::from(format!("sequence {}", sent)),
                            )
                            .expect("send");
                    }
                }
                Event::Delivery { delivery, .. } => {
                    if delivery.remote_state == Some(DeliveryState::Accepted) {
                        accepted += 1;
                        if accepted == count {
                            println!("all {} messages accepted", count);
                            batch.engine().unwrap().connection().close(None);
                        }
                    }
                }
                Event::TransportClosed { condition, .. } => {
                    if let Some(condition) = condition {
                        eprintln!("connection failed: {}", condition);
                    }
                    batch.container().stop();
                }
                _ => {}
            }
        }
    })?;

    container.run().await;
    Ok(())
}
