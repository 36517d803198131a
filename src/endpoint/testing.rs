use crate::endpoint::EventSender;
use crate::peer::connection::{LinkTransport, TransportFactory};
use crate::peer::link::TransportCommand;
use std::sync::{Arc, Mutex};

/// Transport double that records every command per link generation
#[derive(Clone, Default)]
pub(crate) struct RecordingFactory {
    log: Arc<Mutex<Vec<(u64, TransportCommand)>>>,
}

impl RecordingFactory {
    pub fn commands(&self, generation: u64) -> Vec<TransportCommand> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(g, _)| *g == generation)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

struct RecordingTransport {
    generation: u64,
    log: Arc<Mutex<Vec<(u64, TransportCommand)>>>,
}

impl LinkTransport for RecordingTransport {
    fn execute(&self, command: TransportCommand) {
        self.log.lock().unwrap().push((self.generation, command));
    }
}

impl TransportFactory for RecordingFactory {
    fn create(&self, generation: u64, _events: EventSender) -> Box<dyn LinkTransport> {
        Box::new(RecordingTransport {
            generation,
            log: self.log.clone(),
        })
    }
}
