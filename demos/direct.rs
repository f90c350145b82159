//! Direct Receiver Demo
//!
//! Listens for a single AMQP 1.0 connection without an intermediary broker,
//! grants credit to the peer's sender and accepts every delivery, then exits
//! when the peer disconnects.
//!
//! ```text
//! cargo run --example direct -- amqp://127.0.0.1:5672
//! ```

use dumq_amqp_io::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "amqp://127.0.0.1:5672".to_string());

    let container = Container::new("direct-demo");
    let mut received = 0u32;
    container.listen(&url, move |batch: &mut Batch| {
        while let Some(event) = batch.next() {
            match &event {
                Event::ListenerOpen { addr, .. } => {
                    println!("listening on {}", addr);
                }
                Event::ConnectionRemoteOpen { .. } => {
                    batch.engine().unwrap().connection().open();
                }
                Event::LinkRemoteOpen { link, role, .. } => {
                    if *role == Role::Receiver {
                        batch
                            .engine()
                            .unwrap()
                            .connection()
                            .flow(*link, 100)
                            .expect("grant credit");
                    }
                }
                Event::Delivery { link, delivery, .. } => {
                    if let Some(payload) = &delivery.payload {
                        received += 1;
                        println!("received: {}", String::from_utf8_lossy(payload));
                        batch
                            .engine()
                            .unwrap()
                            .connection()
                            .accept(*link, delivery.id)
                            .expect("accept delivery");
                    }
                }
                Event::TransportClosed { .. } => {
                    println!("peer disconnected after {} messages", received);
                    batch.container().stop();
                }
                _ => {}
            }
        }
    })?;

    container.run().await;
    Ok(())
}
