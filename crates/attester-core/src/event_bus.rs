//! Broadcast bus for attester events.
//!
//! Round transitions and submission results are published here so that
//! observers (the service binary, tests) can follow the protocol without
//! reaching into the engine.

use attester_types::AttesterEvent;
use tokio::sync::broadcast;

pub struct EventBus {
	sender: broadcast::Sender<AttesterEvent>,
}

impl EventBus {
	/// Creates a bus buffering up to `capacity` events per lagging subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<AttesterEvent> {
		self.sender.subscribe()
	}

	/// Publishes an event. Fails only when nobody is subscribed.
	pub fn publish(
		&self,
		event: AttesterEvent,
	) -> Result<(), broadcast::error::SendError<AttesterEvent>> {
		self.sender.send(event)?;
		Ok(())
	}
}

impl Clone for EventBus {
	fn clone(&self) -> Self {
		Self {
			sender: self.sender.clone(),
		}
	}
}
