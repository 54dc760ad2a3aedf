use crate::message::ForwardMsg;

/// Outbound messages of one session, waiting for the delivery loop.
#[derive(Debug, Default)]
pub struct ForwardMsgQueue {
    queue: Vec<ForwardMsg>,
}

impl ForwardMsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `msg`. A new element aimed at the delta path of a new element
    /// still waiting here replaces it in place.
    pub fn enqueue(&mut self, msg: ForwardMsg) {
        if msg.is_new_element() {
            let slot = self
                .queue
                .iter_mut()
                .rev()
                .find(|queued| queued.is_new_element() && queued.delta_path() == msg.delta_path());
            if let Some(slot) = slot {
                *slot = msg;
                return;
            }
        }
        self.queue.push(msg);
    }

    pub fn flush(&mut self) -> Vec<ForwardMsg> {
        std::mem::take(&mut self.queue)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
