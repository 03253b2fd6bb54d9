//! Session lifecycle: ordered bring-up and tear-down of the control and
//! input planes.
//!
//! The control stream must be live before the input stream, because Gen5+
//! hosts carry input on the control channel. Tear-down runs in reverse.

use crate::config::StreamConfig;
use crate::control::ControlStream;
use crate::input::InputStream;
use crate::shared::{ConnectionListener, StreamResult};
use basalt::logging::{self, Logger};
use std::sync::Arc;

/// One streaming session against a single host.
pub struct Session {
    control: ControlStream,
    input: InputStream,
}

impl Session {
    /// Brings up the control channel, performs the start handshake, then
    /// opens the input plane. Tears down whatever came up on failure.
    pub fn start<'a, L: Into<Option<&'a Logger>>>(
        config: &StreamConfig,
        listener: Arc<dyn ConnectionListener>,
        log: L,
    ) -> StreamResult<Session> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let control = ControlStream::start(config, listener, log.new(logging::o!()))?;

        let sink = control.core().clone();
        let input = match InputStream::start(config, sink, log.new(logging::o!())) {
            Ok(input) => input,
            Err(err) => {
                control.stop();
                return Err(err);
            }
        };

        Ok(Session { control, input })
    }

    /// Stops both planes. Safe to call more than once; also runs on drop.
    pub fn stop(&self) {
        self.input.stop();
        self.control.stop();
    }

    /// The input plane: mouse, keyboard, controller, scroll senders.
    #[inline]
    pub fn input(&self) -> &InputStream {
        &self.input
    }

    /// Reports a span of frames the decoder has lost.
    #[inline]
    pub fn connection_detected_frame_loss(&self, start_frame: i32, end_frame: i32) {
        self.control.core().detected_frame_loss(start_frame, end_frame);
    }

    /// Reports a fully reassembled frame.
    #[inline]
    pub fn connection_received_complete_frame(&self, frame_index: i32) {
        self.control.core().received_complete_frame(frame_index);
    }

    /// Reports that a frame was observed on the wire, complete or not.
    #[inline]
    pub fn connection_saw_frame(&self, frame_index: i32) {
        self.control.core().saw_frame(frame_index);
    }

    /// Reports a gap in the video packet sequence.
    #[inline]
    pub fn connection_lost_packets(&self, last_received: i32, next_received: i32) {
        self.control.core().lost_packets(last_received, next_received);
    }

    /// Demands an IDR frame on behalf of the decoder.
    #[inline]
    pub fn request_idr_on_demand(&self) {
        self.control.core().request_idr_on_demand();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
