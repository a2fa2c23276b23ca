//! The generate-then-speak turn pipeline.
//!
//! A turn walks one session through `Idle -> Thinking -> Speaking -> Idle`:
//!
//! 1. `{"type":"thinking","thinking":true}` goes out and the reply is
//!    generated with the session's prompt;
//! 2. when audio is enabled the agent's room publisher is connected. A failed
//!    connection ends the turn with `thinking:false` and nothing else;
//! 3. the session enters `Speaking`: the agent transcript goes out, followed
//!    by `thinking:false`;
//! 4. the reply is synthesized and every chunk is resampled, framed and
//!    pushed onto the agent's track in order.
//!
//! The session returns to `Idle` however the turn ends. Stopping the session
//! cancels the turn at its next suspension point and drops the synthesis
//! stream, which releases the backend.

use crate::generate::ResponseGenerator;
use crate::sessions::{PromptStore, SessionSettings, TurnError, TurnGuard, TurnTracker};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voxrelay_types::{ControlEvent, SessionKey, TurnPhase};
use voxrelay_voice::{
    AudioFormat, AudioFrame, FramePipeline, PublisherRegistry, SpeechSynthesizer,
    SynthesisRequest, VoiceError,
};

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Transcript delivered and the whole reply published.
    Spoken { frames: usize },
    /// Transcript delivered without audio (no backend, or it was unavailable).
    TextOnly,
    /// Transcript delivered, audio cut short by a synthesis or room error.
    AudioFailed { frames: usize },
    /// The agent could not join the room; no transcript was sent.
    ConnectFailed,
    /// No reply could be generated.
    GenerationFailed,
    /// The session was stopped mid-turn.
    Cancelled { frames: usize },
}

/// Tunables for the audio half of a turn.
#[derive(Debug, Clone)]
pub struct SpeechSettings {
    /// Publish format frames are cut to.
    pub format: AudioFormat,
    /// Longest wait for synthesis to start and for each chunk after that.
    pub chunk_timeout: Duration,
    pub latency_hint: u8,
}

enum SpeechEnd {
    Completed,
    Unavailable,
    Failed,
    Cancelled,
}

struct SpeechReport {
    frames: usize,
    end: SpeechEnd,
}

/// Runs turns and session teardown against the shared registries.
#[derive(Debug)]
pub struct TurnCoordinator {
    prompts: Arc<PromptStore>,
    turns: Arc<TurnTracker>,
    publishers: Arc<PublisherRegistry>,
    generator: Arc<dyn ResponseGenerator>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    speech: SpeechSettings,
}

impl TurnCoordinator {
    pub fn new(
        prompts: Arc<PromptStore>,
        turns: Arc<TurnTracker>,
        publishers: Arc<PublisherRegistry>,
        generator: Arc<dyn ResponseGenerator>,
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
        speech: SpeechSettings,
    ) -> Self {
        Self {
            prompts,
            turns,
            publishers,
            generator,
            synthesizer,
            speech,
        }
    }

    pub fn prompts(&self) -> &PromptStore {
        &self.prompts
    }

    pub fn turns(&self) -> &TurnTracker {
        &self.turns
    }

    pub fn publishers(&self) -> &PublisherRegistry {
        &self.publishers
    }

    /// Returns `true` when replies are spoken as well as sent as text.
    pub fn speaks(&self) -> bool {
        self.synthesizer.is_some()
    }

    /// Claims the session and runs the turn on its own task.
    ///
    /// Fails with [`TurnError::Busy`] while the session has a turn in flight.
    /// Events for the turn are written to `events` as JSON text.
    pub fn submit(
        self: &Arc<Self>,
        key: &SessionKey,
        text: String,
        events: mpsc::Sender<String>,
    ) -> Result<JoinHandle<TurnOutcome>, TurnError> {
        let turn = self.turns.begin(key)?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.run(turn, text, events).await }))
    }

    /// Registers a session's prompt and voice overrides.
    pub fn start_session(
        &self,
        key: SessionKey,
        system_prompt: Option<String>,
        voice: Option<String>,
        model: Option<String>,
    ) {
        info!(session = %key, "session started");
        self.publishers.register(&key);
        self.prompts.start(key, system_prompt, voice, model);
    }

    /// Forgets the session's prompt, cancels its turn and leaves the room.
    pub async fn stop_session(&self, key: &SessionKey) {
        let had_prompt = self.prompts.stop(key);
        let cancelled = self.turns.cancel(key);
        self.publishers.close(key).await;
        info!(
            session = %key,
            had_prompt,
            cancelled_turn = cancelled,
            "session stopped"
        );
    }

    async fn run(&self, turn: TurnGuard, text: String, events: mpsc::Sender<String>) -> TurnOutcome {
        let key = turn.key().clone();
        let settings = self.prompts.resolve(&key);
        debug!(session = %key, chars = text.len(), "turn started");

        emit(&events, &ControlEvent::thinking(true)).await;

        let generated = tokio::select! {
            biased;
            () = turn.cancelled() => {
                emit(&events, &ControlEvent::thinking(false)).await;
                return TurnOutcome::Cancelled { frames: 0 };
            }
            reply = self.generator.generate(&settings.system_prompt, &text) => reply,
        };
        let reply = match generated {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session = %key, "response generation failed: {}", e);
                emit(&events, &ControlEvent::thinking(false)).await;
                return TurnOutcome::GenerationFailed;
            }
        };

        if self.synthesizer.is_some() {
            let connected = tokio::select! {
                biased;
                () = turn.cancelled() => {
                    emit(&events, &ControlEvent::thinking(false)).await;
                    return TurnOutcome::Cancelled { frames: 0 };
                }
                result = self.publishers.ensure_connected(&key) => result,
            };
            if let Err(e) = connected {
                warn!(session = %key, "dropping turn, agent could not join the room: {}", e);
                emit(&events, &ControlEvent::thinking(false)).await;
                return TurnOutcome::ConnectFailed;
            }
        }

        turn.set_phase(TurnPhase::Speaking);
        emit(&events, &ControlEvent::agent_transcript(reply.clone())).await;
        emit(&events, &ControlEvent::thinking(false)).await;

        let Some(synthesizer) = &self.synthesizer else {
            return TurnOutcome::TextOnly;
        };

        let report = self
            .speak(&turn, synthesizer.as_ref(), &settings, reply)
            .await;
        let frames = report.frames;
        let outcome = match report.end {
            SpeechEnd::Completed => TurnOutcome::Spoken { frames },
            SpeechEnd::Unavailable => TurnOutcome::TextOnly,
            SpeechEnd::Failed => TurnOutcome::AudioFailed { frames },
            SpeechEnd::Cancelled => TurnOutcome::Cancelled { frames },
        };
        debug!(session = %key, ?outcome, "turn finished");
        outcome
    }

    async fn speak(
        &self,
        turn: &TurnGuard,
        synthesizer: &dyn SpeechSynthesizer,
        settings: &SessionSettings,
        text: String,
    ) -> SpeechReport {
        let key = turn.key();
        let source_rate = synthesizer.source_sample_rate();
        let request = SynthesisRequest {
            text,
            voice: settings
                .voice
                .clone()
                .unwrap_or_else(|| synthesizer.default_voice().to_string()),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| synthesizer.default_model().to_string()),
            sample_rate: source_rate,
            latency_hint: self.speech.latency_hint,
        };

        let mut report = SpeechReport {
            frames: 0,
            end: SpeechEnd::Completed,
        };

        let started = tokio::select! {
            biased;
            () = turn.cancelled() => {
                report.end = SpeechEnd::Cancelled;
                return report;
            }
            started = tokio::time::timeout(
                self.speech.chunk_timeout,
                synthesizer.synthesize(request),
            ) => started,
        };
        let started = match started {
            Ok(started) => started,
            Err(_) => {
                warn!(
                    session = %key,
                    backend = synthesizer.name(),
                    "synthesis did not start within {:?}",
                    self.speech.chunk_timeout
                );
                report.end = SpeechEnd::Failed;
                return report;
            }
        };
        let mut chunks = match started {
            Ok(chunks) => chunks,
            Err(e) if e.is_unavailable() => {
                info!(
                    session = %key,
                    backend = synthesizer.name(),
                    "speech synthesis unavailable, reply sent as text only: {}",
                    e
                );
                report.end = SpeechEnd::Unavailable;
                return report;
            }
            Err(e) => {
                warn!(session = %key, backend = synthesizer.name(), "speech synthesis failed: {}", e);
                report.end = SpeechEnd::Failed;
                return report;
            }
        };

        let mut pipeline = match FramePipeline::new(
            source_rate,
            synthesizer.source_channels(),
            self.speech.format,
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!(session = %key, "cannot frame synthesized audio: {}", e);
                report.end = SpeechEnd::Failed;
                return report;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                () = turn.cancelled() => {
                    report.end = SpeechEnd::Cancelled;
                    break;
                }
                next = tokio::time::timeout(self.speech.chunk_timeout, chunks.next()) => next,
            };

            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(session = %key, frames = report.frames, "synthesis stream failed: {}", e);
                    report.end = SpeechEnd::Failed;
                    break;
                }
                Err(_) => {
                    warn!(
                        session = %key,
                        frames = report.frames,
                        "no audio from synthesis within {:?}",
                        self.speech.chunk_timeout
                    );
                    report.end = SpeechEnd::Failed;
                    break;
                }
            };

            let frames = match pipeline.push_bytes(&chunk) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(session = %key, "audio conversion failed: {}", e);
                    report.end = SpeechEnd::Failed;
                    break;
                }
            };
            if let Err(end) = self.push_all(turn, &frames, &mut report.frames).await {
                report.end = end;
                break;
            }
        }

        // Drop the stream before flushing so the backend is released even if
        // the last pushes wait on backpressure.
        drop(chunks);

        if matches!(report.end, SpeechEnd::Completed) {
            match pipeline.finish() {
                Ok((frames, discarded)) => {
                    if let Err(end) = self.push_all(turn, &frames, &mut report.frames).await {
                        report.end = end;
                    }
                    if discarded > 0 {
                        debug!(session = %key, samples = discarded, "dropped partial trailing frame");
                    }
                }
                Err(e) => {
                    warn!(session = %key, "audio flush failed: {}", e);
                    report.end = SpeechEnd::Failed;
                }
            }
        }

        info!(session = %key, frames = report.frames, "published agent reply");
        report
    }

    async fn push_all(
        &self,
        turn: &TurnGuard,
        frames: &[AudioFrame],
        pushed: &mut usize,
    ) -> Result<(), SpeechEnd> {
        for frame in frames {
            let result = tokio::select! {
                biased;
                () = turn.cancelled() => return Err(SpeechEnd::Cancelled),
                result = self.publishers.push_frame(turn.key(), frame) => result,
            };
            match result {
                Ok(()) => *pushed += 1,
                Err(VoiceError::NotConnected(_)) if turn.is_cancelled() => {
                    return Err(SpeechEnd::Cancelled)
                }
                Err(e) => {
                    warn!(session = %turn.key(), frames = *pushed, "frame push failed: {}", e);
                    return Err(SpeechEnd::Failed);
                }
            }
        }
        Ok(())
    }
}

/// Writes one control event to the connection's outbound queue.
async fn emit(events: &mpsc::Sender<String>, event: &ControlEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            if events.send(json).await.is_err() {
                debug!("control channel closed, event dropped");
            }
        }
        Err(e) => tracing::error!("failed to serialize control event: {}", e),
    }
}
