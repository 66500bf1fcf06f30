//! Per-agent loop coordinator: heartbeat tracking, cooldown policy,
//! checkpoint cadence, button accounting, and state publication. Each
//! agent's coordinator is owned by exactly one spawned task (see
//! `spawn`), which doubles as the per-agent mutex: at most one decision
//! can ever be in flight. Agents share nothing but the persistence
//! layer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::decision::{
    fallback_decision, merge_game_state, Decision, DecisionInputs, DecisionOutcome, DecisionStep,
    DecisionSummary, DIALOG_HISTORY_LIMIT, FALLBACK_COMPLETION_TOKENS, FALLBACK_PROMPT_TOKENS,
    PREVIOUS_FRAMES_LIMIT,
};
use super::heuristics::{
    self, classify_stuck, event_reward, frame_fingerprint, healing_reward, navigation_reward,
    priority_action, visual_change, StuckKind,
};
use super::memory::{format_notes_for_prompt, MemoryStore, NOTES_PROMPT_LIMIT};
use super::schema::{ButtonScores, GameStateDelta, ScreenTypeReply};
use super::state::{
    AgentRecord, AgentStatus, FrameHistory, FrameHistoryEntry, GameState, ScreenKind, VisualChange,
};
use super::stats::ButtonStats;
use crate::frame::{Button, CapturedFrame, FrameError, FrameSource};
use crate::model::{cost_for, ModelClient, TokenUsage};
use crate::savestate;
use crate::store::{agent_key, blob, leaderboard_key, ttl, BlobStore, KvStore};

pub const ITERATION_PERIOD: Duration = Duration::from_secs(3);
pub const DIALOGUE_COOLDOWN: Duration = Duration::from_secs(8);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(500);
pub const DECISION_DEADLINE: Duration = Duration::from_secs(30);
pub const CHECKPOINT_EVERY: u64 = 100;
pub const PRESS_HOLD_MS: u64 = 150;
pub const PRESS_DELAY: Duration = Duration::from_millis(500);
pub const FRAME_RETRY_BACKOFF: Duration = Duration::from_secs(2);
pub const HEARTBEAT_CADENCE: Duration = Duration::from_secs(10);
pub const CLIENT_GONE_AFTER: Duration = Duration::from_secs(30);
/// Decision summaries retained on the coordinator.
const DECISION_HISTORY_LIMIT: usize = 25;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub iteration_period: Duration,
    pub dialogue_cooldown: Duration,
    pub default_cooldown: Duration,
    pub decision_deadline: Duration,
    pub checkpoint_every: u64,
    pub press_hold_ms: u64,
    pub press_delay: Duration,
    pub frame_retry_backoff: Duration,
    pub client_gone_after: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            iteration_period: ITERATION_PERIOD,
            dialogue_cooldown: DIALOGUE_COOLDOWN,
            default_cooldown: DEFAULT_COOLDOWN,
            decision_deadline: DECISION_DEADLINE,
            checkpoint_every: CHECKPOINT_EVERY,
            press_hold_ms: PRESS_HOLD_MS,
            press_delay: PRESS_DELAY,
            frame_retry_backoff: FRAME_RETRY_BACKOFF,
            client_gone_after: CLIENT_GONE_AFTER,
        }
    }
}

/// Cancellation handle/token pair. The token is cloneable; firing the
/// handle cancels every clone.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// A fresh token observing this handle (for sibling tasks such as
    /// the heartbeat emitter).
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // A dropped sender counts as cancelled.
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

/// Client-liveness snapshot read off the heartbeat key.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatStatus {
    pub alive: bool,
    pub last_beat: Option<DateTime<Utc>>,
    pub elapsed: Option<Duration>,
}

pub async fn record_heartbeat(
    kv: &dyn KvStore,
    agent_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    kv.set(
        &agent_key(agent_id, "heartbeat"),
        now.timestamp_millis().to_string(),
        Some(ttl::HEARTBEAT),
    )
    .await?;
    Ok(())
}

pub async fn read_heartbeat(
    kv: &dyn KvStore,
    agent_id: &str,
    now: DateTime<Utc>,
    gone_after: Duration,
) -> anyhow::Result<HeartbeatStatus> {
    let raw = kv.get(&agent_key(agent_id, "heartbeat")).await?;
    let last_beat = raw
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis);
    let elapsed = last_beat.map(|at| (now - at).to_std().unwrap_or(Duration::ZERO));
    let alive = elapsed.is_some_and(|e| e <= gone_after);
    Ok(HeartbeatStatus {
        alive,
        last_beat,
        elapsed,
    })
}

/// Spawned by in-process clients: refreshes the heartbeat key every 10s
/// until the token fires.
pub fn spawn_heartbeat_emitter(
    kv: Arc<dyn KvStore>,
    agent_id: String,
    mut cancel: CancelToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(HEARTBEAT_CADENCE);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(err) = record_heartbeat(kv.as_ref(), &agent_id, Utc::now()).await {
                        warn!(agent_id = %agent_id, error = %format!("{err:#}"), "heartbeat write failed");
                    }
                }
            }
        }
    })
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// A decision was made and accounted; sleep `cooldown` before the
    /// next capture.
    Decided { cooldown: Duration },
    /// Transient capture failure; nothing advanced.
    FrameUnavailable,
    /// The client went silent or a pause/cancel arrived; the loop parked.
    Paused,
    /// The adapter is gone; terminal for this run.
    AdapterLost,
}

/// Context a client supplies when it drives iterations over HTTP
/// instead of letting the coordinator capture and execute.
#[derive(Debug, Clone, Default)]
pub struct ExternalTurn {
    pub frame: String,
    pub previous_frames: Vec<String>,
    pub command_history: Vec<String>,
    pub previous_scores: Option<ButtonScores>,
    pub dialog_history: Vec<String>,
    pub avoid_start_select: bool,
    pub avoid_wait: bool,
    pub avoid_b: bool,
    pub buttons_to_avoid: Vec<Button>,
    pub banned_buttons: Vec<Button>,
}

/// What a full decide produced, shaped for publication.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub decision: Decision,
    pub game_state: GameState,
    pub screen: ScreenTypeReply,
    pub cost: f64,
    pub record: AgentRecord,
    pub cooldown: Duration,
}

/// Confirmation of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReceipt {
    pub url: String,
    pub path: String,
    pub decision_number: u64,
}

/// Requests served by a spawned agent task. Each carries a reply slot;
/// `Stop` terminates the task.
pub enum AgentRequest {
    Decide {
        turn: ExternalTurn,
        reply: oneshot::Sender<anyhow::Result<TurnResult>>,
    },
    IngestCheckpoint {
        bytes: Vec<u8>,
        decision_number: u64,
        reply: oneshot::Sender<anyhow::Result<CheckpointReceipt>>,
    },
    Record {
        reply: oneshot::Sender<AgentRecord>,
    },
    Pause {
        reply: oneshot::Sender<AgentStatus>,
    },
    Resume {
        reply: oneshot::Sender<AgentStatus>,
    },
    Reset {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Stop,
}

/// Handle to a spawned agent task. The task exclusively owns the
/// coordinator, so every request is serialized by construction.
#[derive(Clone)]
pub struct AgentClient {
    requests: mpsc::Sender<AgentRequest>,
    pub cancel: Arc<CancelHandle>,
}

impl AgentClient {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> AgentRequest,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| anyhow::anyhow!("agent task stopped"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("agent task dropped the request"))
    }

    pub async fn decide(&self, turn: ExternalTurn) -> anyhow::Result<TurnResult> {
        self.call(|reply| AgentRequest::Decide { turn, reply }).await?
    }

    pub async fn ingest_checkpoint(
        &self,
        bytes: Vec<u8>,
        decision_number: u64,
    ) -> anyhow::Result<CheckpointReceipt> {
        self.call(|reply| AgentRequest::IngestCheckpoint {
            bytes,
            decision_number,
            reply,
        })
        .await?
    }

    pub async fn record(&self) -> anyhow::Result<AgentRecord> {
        self.call(|reply| AgentRequest::Record { reply }).await
    }

    pub async fn pause(&self) -> anyhow::Result<AgentStatus> {
        self.call(|reply| AgentRequest::Pause { reply }).await
    }

    pub async fn resume(&self) -> anyhow::Result<AgentStatus> {
        self.call(|reply| AgentRequest::Resume { reply }).await
    }

    pub async fn reset(&self) -> anyhow::Result<()> {
        self.call(|reply| AgentRequest::Reset { reply }).await?
    }

    pub async fn stop(&self) {
        let _ = self.requests.send(AgentRequest::Stop).await;
    }
}

pub struct LoopCoordinator {
    record: AgentRecord,
    stats: ButtonStats,
    frame_history: FrameHistory,
    dialog_history: VecDeque<String>,
    recent_decisions: VecDeque<DecisionSummary>,
    previous_frames: VecDeque<String>,
    last_fingerprint: Option<u32>,
    last_button: Option<Button>,
    last_scores: Option<ButtonScores>,
    last_beat_seen: Option<DateTime<Utc>>,
    last_checkpoint_levels: Option<u32>,
    step: DecisionStep,
    memory: MemoryStore,
    kv: Arc<dyn KvStore>,
    blob: Arc<dyn BlobStore>,
    cfg: CoordinatorConfig,
    cancel: CancelToken,
}

impl LoopCoordinator {
    pub fn new(
        agent_id: impl Into<String>,
        model_id: impl Into<String>,
        model: Arc<dyn ModelClient>,
        kv: Arc<dyn KvStore>,
        blob: Arc<dyn BlobStore>,
        cfg: CoordinatorConfig,
        now: DateTime<Utc>,
    ) -> (Self, Arc<CancelHandle>) {
        let (cancel_handle, cancel) = cancel_pair();
        let memory = MemoryStore::new(kv.clone());
        let coordinator = Self {
            record: AgentRecord::new(agent_id, model_id, now),
            stats: ButtonStats::new(),
            frame_history: FrameHistory::default(),
            dialog_history: VecDeque::new(),
            recent_decisions: VecDeque::new(),
            previous_frames: VecDeque::new(),
            last_fingerprint: None,
            last_button: None,
            last_scores: None,
            last_beat_seen: None,
            last_checkpoint_levels: None,
            step: DecisionStep::new(model),
            memory,
            kv,
            blob,
            cfg,
            cancel,
        };
        (coordinator, Arc::new(cancel_handle))
    }

    pub fn record(&self) -> &AgentRecord {
        &self.record
    }

    pub fn status(&self) -> AgentStatus {
        self.record.status
    }

    /// Spawns the task that exclusively owns this coordinator. With a
    /// frame source the task ticks autonomously (capture and input
    /// execution included); without one it only serves client-driven
    /// turns. Either way the task is the per-agent mutex: requests and
    /// iterations are serialized by construction.
    pub fn spawn(
        self,
        cancel: Arc<CancelHandle>,
        frames: Option<Arc<dyn FrameSource>>,
    ) -> AgentClient {
        let (tx, rx) = mpsc::channel(16);
        let client = AgentClient {
            requests: tx,
            cancel,
        };
        tokio::spawn(self.drive(frames, rx));
        client
    }

    async fn drive(
        mut self,
        frames: Option<Arc<dyn FrameSource>>,
        mut requests: mpsc::Receiver<AgentRequest>,
    ) {
        if let Some(frames) = frames {
            let mut tick = tokio::time::interval(self.cfg.iteration_period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    req = requests.recv() => match req {
                        Some(req) => {
                            if self.handle_request(req).await {
                                return;
                            }
                        }
                        None => return,
                    },
                    _ = tick.tick() => {
                        if self.record.status == AgentStatus::Paused {
                            continue;
                        }
                        match self.iterate(frames.as_ref()).await {
                            IterationOutcome::Decided { cooldown } => {
                                tokio::time::sleep(cooldown).await;
                            }
                            IterationOutcome::FrameUnavailable => {
                                tokio::time::sleep(self.cfg.frame_retry_backoff).await;
                            }
                            IterationOutcome::Paused => {}
                            // Terminal for ticking; keep answering
                            // requests so the last state stays inspectable.
                            IterationOutcome::AdapterLost => break,
                        }
                    }
                }
            }
        }

        while let Some(req) = requests.recv().await {
            if self.handle_request(req).await {
                return;
            }
        }
    }

    /// Serves one request; true means the task should stop.
    async fn handle_request(&mut self, req: AgentRequest) -> bool {
        match req {
            AgentRequest::Decide { turn, reply } => {
                let _ = reply.send(self.decide_external(turn).await);
            }
            AgentRequest::IngestCheckpoint {
                bytes,
                decision_number,
                reply,
            } => {
                let _ = reply.send(self.ingest_checkpoint(bytes, decision_number).await);
            }
            AgentRequest::Record { reply } => {
                let _ = reply.send(self.record.clone());
            }
            AgentRequest::Pause { reply } => {
                self.pause().await;
                let _ = reply.send(self.record.status);
            }
            AgentRequest::Resume { reply } => {
                self.resume();
                let _ = reply.send(self.record.status);
            }
            AgentRequest::Reset { reply } => {
                let _ = reply.send(self.reset().await);
            }
            AgentRequest::Stop => {
                self.enter_paused("stopped").await;
                return true;
            }
        }
        false
    }

    /// One full autonomous iteration: capture, decide, execute, account.
    pub async fn iterate(&mut self, frames: &dyn FrameSource) -> IterationOutcome {
        let now = Utc::now();

        if self.client_gone(now).await {
            self.enter_paused("client heartbeat lost").await;
            return IterationOutcome::Paused;
        }
        if self.cancel.is_cancelled() {
            self.enter_paused("cancelled").await;
            return IterationOutcome::Paused;
        }

        self.record.status = AgentStatus::Thinking;

        let frame = match frames.capture().await {
            Ok(frame) => frame,
            Err(FrameError::FrameUnavailable(reason)) => {
                warn!(agent_id = %self.record.id, reason = %reason, "frame unavailable; backing off");
                self.notify(&format!("Frame unavailable: {reason}")).await;
                self.record.status = AgentStatus::Idle;
                return IterationOutcome::FrameUnavailable;
            }
            Err(err) => {
                error!(agent_id = %self.record.id, error = %err, "adapter lost");
                self.record.status = AgentStatus::Error;
                self.publish_state().await;
                return IterationOutcome::AdapterLost;
            }
        };

        let Some(outcome) = self.decide_with_deadline(&frame, None, now).await else {
            // Cancelled mid-decision: park without accounting.
            self.enter_paused("cancelled during decision").await;
            return IterationOutcome::Paused;
        };

        // Execute the plan. WAIT steps press nothing; cancellation lets
        // the in-progress press finish but stops the rest of the plan.
        self.record.status = AgentStatus::Acting;
        let plan = outcome.decision.execution_plan.clone();
        for (i, button) in plan.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.cfg.press_delay).await;
            }
            if *button != Button::Wait {
                if let Err(err) = frames
                    .press_and_release(*button, self.cfg.press_hold_ms)
                    .await
                {
                    warn!(agent_id = %self.record.id, button = %button, error = %err, "input failed");
                    break;
                }
            }
            self.stats.note_press(*button);
            if self.cancel.is_cancelled() {
                debug!(agent_id = %self.record.id, "cancelled mid-plan; dropping remaining steps");
                break;
            }
        }

        let cooldown = self.settle_turn(&frame, outcome, now).await;

        if self.cancel.is_cancelled() {
            self.enter_paused("cancelled").await;
            return IterationOutcome::Paused;
        }
        self.record.status = AgentStatus::Idle;

        // Checkpoint after accounting so D{n} names the finished count.
        if self.record.total_decisions % self.cfg.checkpoint_every == 0 {
            self.checkpoint(frames).await;
        }

        IterationOutcome::Decided { cooldown }
    }

    /// One externally driven iteration: the client captured the frame
    /// and will execute the returned plan itself.
    pub async fn decide_external(&mut self, turn: ExternalTurn) -> anyhow::Result<TurnResult> {
        let now = Utc::now();

        // A paused loop resumes only after a fresh heartbeat arrived.
        if self.record.status == AgentStatus::Paused {
            let hb = read_heartbeat(
                self.kv.as_ref(),
                &self.record.id,
                now,
                self.cfg.client_gone_after,
            )
            .await?;
            if !hb.alive {
                anyhow::bail!("agent is paused; send a heartbeat to resume");
            }
            self.record.status = AgentStatus::Idle;
        }

        // A client calling decide is alive by definition.
        if let Err(err) = record_heartbeat(self.kv.as_ref(), &self.record.id, now).await {
            warn!(agent_id = %self.record.id, error = %format!("{err:#}"), "heartbeat refresh failed");
        }
        self.last_beat_seen = Some(now);

        let frame = CapturedFrame::from_data_url(turn.frame.clone(), now)?;
        self.record.status = AgentStatus::Thinking;

        let outcome = self
            .decide_with_deadline(&frame, Some(&turn), now)
            .await
            .ok_or_else(|| anyhow::anyhow!("decision cancelled"))?;

        // The client executes the plan; account the presses here so bans
        // and counters stay server-side.
        for button in &outcome.decision.execution_plan {
            self.stats.note_press(*button);
        }

        let cooldown = self.settle_turn(&frame, outcome.clone(), now).await;
        self.record.status = AgentStatus::Idle;

        Ok(TurnResult {
            decision: outcome.decision,
            game_state: self.record.game_state.clone(),
            screen: outcome.screen,
            cost: outcome.cost,
            record: self.record.clone(),
            cooldown,
        })
    }

    /// Runs the decision step under the coordinator deadline and the
    /// cancellation token. `None` means cancelled (not a fallback).
    async fn decide_with_deadline(
        &mut self,
        frame: &CapturedFrame,
        turn: Option<&ExternalTurn>,
        now: DateTime<Utc>,
    ) -> Option<DecisionOutcome> {
        // Visual change feeds the counters before the prompt is built.
        let fingerprint = frame_fingerprint(frame.payload());
        let change = visual_change(self.last_fingerprint, fingerprint);
        if let Some(last) = self.last_button {
            self.stats.note_outcome(last, change);
        }
        match change {
            VisualChange::NoChange => {
                self.record.game_state.progress.consecutive_no_change += 1;
            }
            VisualChange::ChangeDetected => {
                self.record.game_state.progress.consecutive_no_change = 0;
                self.record.game_state.progress.last_effective_action = self.last_button;
            }
            VisualChange::FirstFrame => {}
        }

        let inputs = self.build_inputs(frame, turn).await;

        let mut cancel = self.cancel.clone();
        let deadline = self.cfg.decision_deadline;
        let decided = {
            let step = &self.step;
            tokio::select! {
                _ = cancel.cancelled() => return None,
                decided = tokio::time::timeout(deadline, step.decide(inputs, now)) => decided,
            }
        };

        match decided {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                // The coordinator deadline is authoritative: charge the
                // estimated fallback usage and move on.
                warn!(agent_id = %self.record.id, "decision deadline exceeded");
                let screen = ScreenTypeReply::default();
                let decision = fallback_decision(now, "coordinator deadline");
                let usage =
                    TokenUsage::new(FALLBACK_PROMPT_TOKENS, FALLBACK_COMPLETION_TOKENS);
                let cost = cost_for(&self.record.model_id, usage);
                let game_state = merge_game_state(
                    &self.record.game_state,
                    &GameStateDelta::default(),
                    &screen,
                    decision.button,
                );
                Some(DecisionOutcome {
                    decision,
                    game_state,
                    screen,
                    usage,
                    cost,
                })
            }
        }
    }

    async fn build_inputs(
        &mut self,
        frame: &CapturedFrame,
        turn: Option<&ExternalTurn>,
    ) -> DecisionInputs {
        let notes = self
            .memory
            .get_notes(&self.record.id)
            .await
            .unwrap_or_default();
        let notes_projection = format_notes_for_prompt(&notes, NOTES_PROMPT_LIMIT);

        let recent_buttons = self.frame_history.recent_buttons(5);
        let stuck = classify_stuck(
            &recent_buttons,
            self.record.game_state.progress.consecutive_no_change,
        );
        if let Some(kind) = stuck {
            self.publish_stuck(kind).await;
        }

        // Server-side stats and client hints combine with OR; the model
        // sees one merged hint list either way.
        let mut banned = self.stats.banned_for_prompt();
        let mut buttons_to_avoid = self.stats.buttons_to_avoid().to_vec();
        let (mut avoid_ss, mut avoid_wait, mut avoid_b) = (
            self.stats.avoid_start_select(),
            self.stats.avoid_wait(),
            self.stats.avoid_b(),
        );

        let mut command_history: Vec<String> =
            self.frame_history.iter().map(format_history_line).collect();
        let mut previous_frames: Vec<String> = self.previous_frames.iter().cloned().collect();
        let mut dialog_history: Vec<String> = self.dialog_history.iter().cloned().collect();
        let mut previous_scores = self.last_scores;

        if let Some(turn) = turn {
            for b in &turn.banned_buttons {
                if !banned.contains(b) {
                    banned.push(*b);
                }
            }
            for b in &turn.buttons_to_avoid {
                if !buttons_to_avoid.contains(b) {
                    buttons_to_avoid.push(*b);
                }
            }
            avoid_ss |= turn.avoid_start_select;
            avoid_wait |= turn.avoid_wait;
            avoid_b |= turn.avoid_b;
            if !turn.command_history.is_empty() {
                command_history = turn.command_history.clone();
            }
            if !turn.previous_frames.is_empty() {
                previous_frames = turn.previous_frames.clone();
            }
            if !turn.dialog_history.is_empty() {
                dialog_history = turn.dialog_history.clone();
            }
            if turn.previous_scores.is_some() {
                previous_scores = turn.previous_scores;
            }
        }

        let previous_scores = previous_scores.map(|s| self.stats.apply_floors(s));

        DecisionInputs {
            agent_id: self.record.id.clone(),
            model_id: self.record.model_id.clone(),
            frame: frame.clone(),
            previous_frames,
            command_history,
            previous_scores,
            dialog_history,
            avoid_start_select: avoid_ss,
            avoid_wait,
            avoid_b,
            buttons_to_avoid,
            banned_buttons: banned,
            notes_projection,
            game_state: self.record.game_state.clone(),
            recent_decisions: self.recent_decisions.iter().cloned().collect(),
            priority: priority_action(&self.record.game_state),
            stuck,
            screen_hint: None,
        }
        .normalize()
    }

    /// Accounts a finished decision: histories, memory, rewards,
    /// leaderboards, state publication. Returns the cooldown to apply.
    async fn settle_turn(
        &mut self,
        frame: &CapturedFrame,
        outcome: DecisionOutcome,
        now: DateTime<Utc>,
    ) -> Duration {
        let fingerprint = frame_fingerprint(frame.payload());
        let change = visual_change(self.last_fingerprint, fingerprint);
        let previous_state = self.record.game_state.clone();

        self.frame_history.push(FrameHistoryEntry {
            button: outcome.decision.button,
            reasoning: clip_reasoning(&outcome.decision.reasoning),
            timestamp: now,
            fingerprint,
            visual_change: change,
        });
        self.last_fingerprint = Some(fingerprint);
        self.last_button = Some(outcome.decision.button);
        self.last_scores = Some(outcome.decision.confidence_scores);

        self.previous_frames.push_back(frame.data_url.clone());
        while self.previous_frames.len() > PREVIOUS_FRAMES_LIMIT {
            self.previous_frames.pop_front();
        }
        if let Some(comment) = &outcome.decision.personality_comment {
            self.dialog_history.push_back(comment.clone());
            while self.dialog_history.len() > DIALOG_HISTORY_LIMIT {
                self.dialog_history.pop_front();
            }
        }
        self.recent_decisions.push_back(DecisionSummary {
            button: outcome.decision.button,
            reasoning: clip_reasoning(&outcome.decision.reasoning),
        });
        while self.recent_decisions.len() > DECISION_HISTORY_LIMIT {
            self.recent_decisions.pop_front();
        }

        // Memory writes: notes delta then the decision log line.
        if let Some(notes) = outcome.decision.notes.as_ref().filter(|n| !n.is_empty()) {
            if let Err(err) = self.memory.merge_notes(&self.record.id, notes).await {
                warn!(agent_id = %self.record.id, error = %format!("{err:#}"), "notes merge failed");
            }
        }
        if let Err(err) = self
            .memory
            .append_decision_log(
                &self.record.id,
                outcome.decision.button,
                &outcome.decision.reasoning,
                now,
            )
            .await
        {
            warn!(agent_id = %self.record.id, error = %format!("{err:#}"), "decision log append failed");
        }

        // Totals.
        self.record.total_decisions += 1;
        self.record.frame_count += 1;
        self.record.total_cost += outcome.cost;
        self.record.total_tokens_in += outcome.usage.prompt_tokens;
        self.record.total_tokens_out += outcome.usage.completion_tokens;
        if outcome.decision.is_fallback {
            self.record.fallback_count += 1;
        }
        self.record.game_state = outcome.game_state;
        self.record.updated_at = now;

        self.apply_rewards(&previous_state, frame, now).await;
        self.publish_state().await;

        if self.record.game_state.screen_type == ScreenKind::Dialogue {
            self.cfg.dialogue_cooldown
        } else {
            self.cfg.default_cooldown
        }
    }

    /// Reward shaping over the state transition, persisted best-effort.
    async fn apply_rewards(
        &mut self,
        previous: &GameState,
        frame: &CapturedFrame,
        now: DateTime<Utc>,
    ) {
        // Navigation: newly visited areas since the previous snapshot.
        let prev_count = previous.progress.visited_areas.len();
        let new_areas: Vec<String> = self
            .record
            .game_state
            .progress
            .visited_areas
            .get(prev_count..)
            .unwrap_or(&[])
            .to_vec();
        if !new_areas.is_empty() {
            for area in &new_areas {
                let _ = self
                    .kv
                    .sadd(&agent_key(&self.record.id, "locations"), area.clone())
                    .await;
            }
            self.push_reward("navigation", navigation_reward(new_areas.len()), now)
                .await;
        }

        // Healing: positive party HP delta.
        let healed = healing_reward(
            previous.party_hp.current,
            self.record.game_state.party_hp.current,
            self.record.game_state.party_hp.max,
        );
        if healed > 0.0 {
            self.record.game_state.progress.healing_reward_total += healed;
            self.push_reward("healing", healed, now).await;
        }

        // Milestones derived from the state transition.
        let milestones = heuristics::derive_milestones(previous, &self.record.game_state);
        for milestone in milestones {
            if !self
                .record
                .game_state
                .progress
                .complete_milestone(&milestone)
            {
                continue;
            }
            let reward = event_reward(&milestone) as f64;
            info!(agent_id = %self.record.id, milestone = %milestone, reward, "milestone reached");
            let _ = self
                .kv
                .sadd(
                    &agent_key(&self.record.id, "milestones"),
                    milestone.clone(),
                )
                .await;
            self.push_reward("event", reward, now).await;

            // Milestone screenshot, best-effort.
            if let Ok(bytes) = frame.decode_bytes() {
                let path = blob::milestone_path(&self.record.id, &milestone, now);
                if let Err(err) = self.blob.put(&path, bytes).await {
                    warn!(agent_id = %self.record.id, error = %err, "milestone screenshot upload failed");
                }
            }
        }

        // Leaderboards: member = agent id, score = latest value, so
        // concurrent updates from other agents commute.
        let id = self.record.id.clone();
        let _ = self
            .kv
            .zadd(
                &leaderboard_key("badges"),
                id.clone(),
                self.record.game_state.badges as f64,
            )
            .await;
        let _ = self
            .kv
            .zadd(
                &leaderboard_key("milestones"),
                id.clone(),
                self.record.game_state.progress.milestones.len() as f64,
            )
            .await;
        let _ = self
            .kv
            .zadd(&leaderboard_key("cost"), id, self.record.total_cost)
            .await;
    }

    async fn push_reward(&self, kind: &str, value: f64, now: DateTime<Utc>) {
        let key = agent_key(&self.record.id, "rewards");
        let entry = json!({"kind": kind, "value": value, "timestamp": now.to_rfc3339()});
        if self.kv.rpush(&key, entry.to_string()).await.is_ok() {
            let _ = self.kv.expire(&key, ttl::REWARD_HISTORY).await;
        }
    }

    async fn publish_stuck(&self, kind: StuckKind) {
        let key = agent_key(&self.record.id, "stuck");
        let entry = json!({"kind": kind, "at": Utc::now().to_rfc3339()});
        if self
            .kv
            .set(&key, entry.to_string(), Some(ttl::STUCK_STATE))
            .await
            .is_err()
        {
            warn!(agent_id = %self.record.id, "stuck state write failed");
        }
    }

    /// Publishes the merged record with a 24h TTL and bumps counters.
    /// Persistence failures never stop the loop.
    async fn publish_state(&self) {
        let raw = match serde_json::to_string(&self.record) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(agent_id = %self.record.id, error = %err, "state serialize failed");
                return;
            }
        };
        if let Err(err) = self
            .kv
            .set(
                &agent_key(&self.record.id, "state"),
                raw,
                Some(ttl::AGENT_STATE),
            )
            .await
        {
            warn!(agent_id = %self.record.id, error = %err, "state publish failed");
        }
        let _ = self
            .kv
            .set(
                &agent_key(&self.record.id, "decisions"),
                self.record.total_decisions.to_string(),
                Some(ttl::AGENT_STATE),
            )
            .await;
        let _ = self
            .kv
            .set(
                &agent_key(&self.record.id, "frames"),
                self.record.frame_count.to_string(),
                Some(ttl::AGENT_STATE),
            )
            .await;
        let _ = self
            .kv
            .set(
                &agent_key(&self.record.id, "progress"),
                serde_json::to_string(&self.record.game_state.progress).unwrap_or_default(),
                Some(ttl::AGENT_STATE),
            )
            .await;
    }

    /// Save-state checkpoint at the cadence boundary. Failures are
    /// logged and retried only at the next boundary.
    async fn checkpoint(&mut self, frames: &dyn FrameSource) {
        let bytes = match frames.save_state().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(agent_id = %self.record.id, error = %err, "save-state request failed");
                return;
            }
        };
        if let Err(err) = self
            .ingest_checkpoint(bytes, self.record.total_decisions)
            .await
        {
            warn!(agent_id = %self.record.id, error = %format!("{err:#}"), "checkpoint upload failed");
        }
    }

    /// Accounts and stores checkpoint bytes, wherever they came from:
    /// the cadence path requests them from the frame source, clients
    /// upload them over HTTP. Level rewards come from the parsed party
    /// table; unrecognized layouts just skip the reward.
    pub async fn ingest_checkpoint(
        &mut self,
        bytes: Vec<u8>,
        decision_number: u64,
    ) -> anyhow::Result<CheckpointReceipt> {
        if let savestate::ParseOutcome::Parsed(parsed) = savestate::parse(&bytes) {
            let total: u32 = parsed.party_levels.iter().map(|l| *l as u32).sum();
            if let Some(prev) = self.last_checkpoint_levels {
                let reward = heuristics::level_reward(prev, total);
                if reward > 0.0 {
                    self.record.game_state.progress.level_reward_total += reward;
                    self.push_reward("level", reward, Utc::now()).await;
                    self.publish_state().await;
                }
            }
            self.last_checkpoint_levels = Some(total);
        }

        let path = blob::checkpoint_path(
            &self.record.id,
            decision_number,
            &self.record.model_id,
            Utc::now(),
        );
        let url = self.blob.put(&path, bytes).await?;
        info!(agent_id = %self.record.id, url = %url, "checkpoint uploaded");
        Ok(CheckpointReceipt {
            url,
            path,
            decision_number,
        })
    }

    async fn client_gone(&mut self, now: DateTime<Utc>) -> bool {
        let status = match read_heartbeat(
            self.kv.as_ref(),
            &self.record.id,
            now,
            self.cfg.client_gone_after,
        )
        .await
        {
            Ok(status) => status,
            Err(err) => {
                warn!(agent_id = %self.record.id, error = %format!("{err:#}"), "heartbeat read failed");
                return false;
            }
        };
        if let Some(at) = status.last_beat {
            self.last_beat_seen = Some(at);
        }
        match (status.alive, self.last_beat_seen) {
            (true, _) => false,
            // Never beaten: a fresh agent is not "gone".
            (false, None) => false,
            (false, Some(last)) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                elapsed > self.cfg.client_gone_after
            }
        }
    }

    /// Parks the loop on behalf of a client request.
    pub async fn pause(&mut self) {
        self.enter_paused("pause requested").await;
    }

    /// Returns a paused loop to idle.
    pub fn resume(&mut self) {
        if self.record.status == AgentStatus::Paused {
            self.record.status = AgentStatus::Idle;
            info!(agent_id = %self.record.id, "resumed");
        }
    }

    async fn enter_paused(&mut self, reason: &str) {
        if self.record.status != AgentStatus::Paused {
            info!(agent_id = %self.record.id, reason = %reason, "pausing");
        }
        self.record.status = AgentStatus::Paused;
        self.record.updated_at = Utc::now();
        self.publish_state().await;
    }

    /// Reset: clear in-memory accounting, notes, the log, and every
    /// namespaced key, then reinitialize game state.
    pub async fn reset(&mut self) -> anyhow::Result<()> {
        self.stats.reset();
        self.frame_history.clear();
        self.dialog_history.clear();
        self.recent_decisions.clear();
        self.previous_frames.clear();
        self.last_fingerprint = None;
        self.last_button = None;
        self.last_scores = None;
        self.last_checkpoint_levels = None;

        self.memory.clear(&self.record.id).await?;
        self.kv
            .del_prefix(&format!("agent:{}:", self.record.id))
            .await?;

        let now = Utc::now();
        self.record.game_state = GameState::default();
        self.record.total_decisions = 0;
        self.record.frame_count = 0;
        self.record.fallback_count = 0;
        self.record.total_cost = 0.0;
        self.record.total_tokens_in = 0;
        self.record.total_tokens_out = 0;
        self.record.status = AgentStatus::Idle;
        self.record.updated_at = now;
        info!(agent_id = %self.record.id, "reset complete");
        Ok(())
    }

    async fn notify(&self, message: &str) {
        // User-visible toast channel: a short-lived key the UI polls.
        let key = agent_key(&self.record.id, "notice");
        let _ = self
            .kv
            .set(&key, message.to_string(), Some(Duration::from_secs(30)))
            .await;
    }
}

fn clip_reasoning(reasoning: &str) -> String {
    const MAX: usize = 120;
    if reasoning.chars().count() <= MAX {
        return reasoning.to_string();
    }
    reasoning.chars().take(MAX).collect()
}

fn format_history_line(entry: &FrameHistoryEntry) -> String {
    let marker = match entry.visual_change {
        VisualChange::FirstFrame => "first_frame",
        VisualChange::ChangeDetected => "change_detected",
        VisualChange::NoChange => "no_change",
    };
    format!("{} ({marker}): {}", entry.button.name(), entry.reasoning)
}
