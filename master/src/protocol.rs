//! Tabla de transiciones del protocolo worker <-> coordinador.

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use tracing::{debug, info, warn};

use common::{
    JobInstructions, JobPhase, Message, MessageType, SchedulerError, StorageError, TaskId,
    TaskKind, WorkerId, WorkerState,
};

use crate::coordinator::{CoordResult, Coordinator};

impl Coordinator {
    /// Aplica un mensaje recibido de `id` y después reparte trabajo.
    pub fn handle_message(&mut self, id: WorkerId, msg: Message, now: Instant) -> CoordResult {
        let result = self.apply_message(id, msg, now);
        self.contain(result, now)
    }

    fn apply_message(&mut self, id: WorkerId, msg: Message, now: Instant) -> CoordResult {
        let Some(conn) = self.workers.get_mut(id) else {
            debug!(worker = id, kind = ?msg.kind, "mensaje de una conexión ya removida");
            return Ok(());
        };
        conn.last_heartbeat = now;
        conn.acknowledge(msg.kind);

        match msg.kind {
            MessageType::Subscribe => self.on_subscribe(id),
            MessageType::SubmitJob => self.submit(id, &msg, now)?,
            MessageType::JobReadyToReceive => self.on_ready_to_receive(id, now)?,
            MessageType::JobInstructionsFileAck => {
                if let Some(conn) = self.workers.get_mut(id) {
                    conn.instructions_acked = true;
                }
                self.maybe_start(id, now);
            }
            MessageType::DatafileAck => {
                if let Some(conn) = self.workers.get_mut(id) {
                    conn.data_acked = true;
                }
                self.maybe_start(id, now);
            }
            MessageType::JobStartAck => self.on_start_ack(id)?,
            MessageType::JobDone => self.on_job_done(id, &msg, now)?,
            MessageType::JobHeartbeat => self.on_heartbeat(id, &msg),
            MessageType::SubmittedJobFinishedAck => self.on_finished_ack(id),
            other => {
                warn!(worker = id, kind = ?other, "mensaje inesperado, se ignora");
            }
        }

        self.distribute(now)
    }

    fn on_subscribe(&mut self, id: WorkerId) {
        if let Some(conn) = self.workers.get_mut(id) {
            if !conn.subscribed {
                conn.subscribed = true;
                conn.state = WorkerState::Idle;
                info!(worker = id, peer = %conn.peer, "worker suscrito");
            }
            conn.send(&Message::empty(MessageType::SubscribeAck));
        }
    }

    /// El worker está listo: le mandamos instrucciones y datos, cada uno
    /// con su propio ack pendiente.
    fn on_ready_to_receive(&mut self, id: WorkerId, now: Instant) -> CoordResult {
        let timeout = self.config.ack_timeout;
        let Some(conn) = self.workers.get_mut(id) else {
            return Ok(());
        };
        let Some(task_id) = conn.task else {
            warn!(worker = id, "JOB_READY_TO_RECEIVE sin tarea asignada");
            return Ok(());
        };
        if conn.state != WorkerState::Assigned {
            warn!(worker = id, state = ?conn.state, "JOB_READY_TO_RECEIVE repetido");
            return Ok(());
        }
        let Some(task) = self.graph.get(task_id) else {
            warn!(worker = id, task = task_id, "la tarea asignada ya no existe");
            return Ok(());
        };

        let instructions = JobInstructions {
            kernel: task.kernel.clone(),
            kind: task.kind,
            worker_count: task.worker_count,
            partition_index: task.partition_index,
        };
        let input: PathBuf = task.input.clone().unwrap_or_default();
        let instructions = Message::job_instructions(&instructions).map_err(|e| {
            SchedulerError::Invariant(format!("instructions for task {task_id} do not encode: {e}"))
        })?;

        conn.instructions_acked = false;
        conn.data_acked = false;
        conn.state = WorkerState::AwaitingInstrAck;
        conn.send_expecting(
            instructions,
            MessageType::JobInstructionsFileAck,
            now,
            timeout,
        );
        conn.send_expecting(
            Message::datafile(input.display().to_string()),
            MessageType::DatafileAck,
            now,
            timeout,
        );
        debug!(worker = id, task = task_id, input = %input.display(), "instrucciones y datos enviados");
        Ok(())
    }

    /// Con los dos acks recibidos se manda JOB_START.
    fn maybe_start(&mut self, id: WorkerId, now: Instant) {
        let timeout = self.config.ack_timeout;
        let Some(conn) = self.workers.get_mut(id) else {
            return;
        };
        if conn.task.is_none() {
            warn!(worker = id, "ack de handshake sin tarea asignada");
            return;
        }
        if !matches!(
            conn.state,
            WorkerState::AwaitingInstrAck | WorkerState::AwaitingDataAck
        ) {
            return;
        }

        match (conn.instructions_acked, conn.data_acked) {
            (true, true) => {
                conn.state = WorkerState::Starting;
                conn.send_expecting(
                    Message::empty(MessageType::JobStart),
                    MessageType::JobStartAck,
                    now,
                    timeout,
                );
                debug!(worker = id, task = ?conn.task, "JOB_START enviado");
            }
            (true, false) => conn.state = WorkerState::AwaitingDataAck,
            _ => conn.state = WorkerState::AwaitingInstrAck,
        }
    }

    fn on_start_ack(&mut self, id: WorkerId) -> CoordResult {
        let Some(conn) = self.workers.get_mut(id) else {
            return Ok(());
        };
        let Some(task_id) = conn.task else {
            warn!(worker = id, "JOB_START_ACK sin tarea asignada");
            return Ok(());
        };
        match conn.state {
            WorkerState::Starting => {}
            // ack de un JOB_START reenviado
            WorkerState::Running => return Ok(()),
            other => {
                warn!(worker = id, task = task_id, state = ?other, "JOB_START_ACK sin JOB_START, se ignora");
                return Ok(());
            }
        }
        conn.state = WorkerState::Running;
        self.graph.mark_running(task_id)?;
        info!(worker = id, task = task_id, "tarea corriendo");
        Ok(())
    }

    fn on_job_done(&mut self, id: WorkerId, msg: &Message, now: Instant) -> CoordResult {
        let locator = match msg.text() {
            Ok(text) => PathBuf::from(text),
            Err(e) => {
                warn!(worker = id, "JOB_DONE ilegible: {e}");
                return Ok(());
            }
        };
        let Some(conn) = self.workers.get(id) else {
            return Ok(());
        };
        let Some(task_id) = conn.task else {
            warn!(worker = id, "JOB_DONE sin tarea asignada, se ignora");
            return Ok(());
        };
        if !matches!(conn.state, WorkerState::Starting | WorkerState::Running) {
            warn!(worker = id, task = task_id, state = ?conn.state, "JOB_DONE antes de JOB_START, se ignora");
            return Ok(());
        }

        // un resultado que no está en el storage cuenta como falla del worker
        if let Err(e) = self.check_result(task_id, &locator) {
            return self.evict(id, &format!("resultado inválido de la tarea {task_id}: {e}"));
        }

        if let Some(conn) = self.workers.get_mut(id) {
            conn.reset_to_idle();
            conn.send(&Message::empty(MessageType::JobDoneAck));
        }

        let completion = self.graph.complete(task_id, &locator)?;
        info!(
            worker = id,
            task = task_id,
            kind = ?completion.kind,
            result = %locator.display(),
            "tarea terminada"
        );

        if completion.is_last && self.job_finished() {
            self.finish_job(now)?;
        }
        Ok(())
    }

    /// Map: un directorio con los W shards. Reduce: un archivo.
    fn check_result(&self, task_id: TaskId, locator: &Path) -> Result<(), StorageError> {
        let Some(task) = self.graph.get(task_id) else {
            return Ok(());
        };
        match task.kind {
            TaskKind::Map => self.storage.check_map_output(locator, task.worker_count),
            TaskKind::Reduce => self.storage.check_file(locator),
        }
    }

    fn on_heartbeat(&mut self, id: WorkerId, msg: &Message) {
        let Some(conn) = self.workers.get_mut(id) else {
            return;
        };
        match msg.as_heartbeat() {
            Ok((progress, rate)) => {
                conn.progress = progress;
                conn.rate = Some(rate);
                debug!(worker = id, progress, rate, "heartbeat");
            }
            Err(e) => warn!(worker = id, "heartbeat ilegible: {e}"),
        }
    }

    fn on_finished_ack(&mut self, id: WorkerId) {
        let is_submitter = self.job.as_ref().and_then(|j| j.submitter) == Some(id);
        if is_submitter && self.phase() == JobPhase::Done {
            self.reset_job();
        } else {
            warn!(worker = id, "SUBMITTED_JOB_FINISHED_ACK fuera de lugar");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::coordinator::testkit::Harness;
    use common::{Message, MessageType, SubmitJob, TaskStatus, WorkerState};

    fn submit(h: &mut Harness, client: u64, data: &str) {
        let data = h.write_data("input.txt", data);
        h.send(
            client,
            Message::submit_job(&SubmitJob {
                mapper: "word_count".into(),
                reducer: "word_count".into(),
                data_path: data.display().to_string(),
            })
            .unwrap(),
        );
    }

    #[test]
    fn subscribe_is_acked() {
        let mut h = Harness::new("subscribe");
        let w = h.connect();
        h.send(w, Message::subscribe());
        assert_eq!(h.kinds(w), vec![MessageType::SubscribeAck]);
        assert_eq!(h.coord.workers.get(w).unwrap().state, WorkerState::Idle);
    }

    #[test]
    fn handshake_walks_the_state_machine() {
        let mut h = Harness::new("handshake");
        let w = h.subscribed_worker();
        let client = h.connect();
        submit(&mut h, client, "a b c\n");
        assert_eq!(h.kinds(client), vec![MessageType::SubmitJobAck]);

        // una sola partición -> un JOB_READY
        let out = h.outbox(w);
        assert_eq!(out.len(), 1);
        let task = out[0].as_task_id().unwrap();
        assert_eq!(h.coord.workers.get(w).unwrap().state, WorkerState::Assigned);

        h.send(w, Message::empty(MessageType::JobReadyToReceive));
        assert_eq!(
            h.kinds(w),
            vec![MessageType::JobInstructionsFile, MessageType::Datafile]
        );
        assert_eq!(h.coord.workers.get(w).unwrap().pending_acks.len(), 2);

        // los acks pueden llegar en cualquier orden
        h.send(w, Message::empty(MessageType::DatafileAck));
        assert!(h.kinds(w).is_empty());
        assert_eq!(
            h.coord.workers.get(w).unwrap().state,
            WorkerState::AwaitingInstrAck
        );
        h.send(w, Message::empty(MessageType::JobInstructionsFileAck));
        assert_eq!(h.kinds(w), vec![MessageType::JobStart]);

        h.send(w, Message::empty(MessageType::JobStartAck));
        assert_eq!(h.coord.workers.get(w).unwrap().state, WorkerState::Running);
        assert_eq!(h.coord.graph.get(task).unwrap().status, TaskStatus::Running);
        assert!(h.coord.workers.get(w).unwrap().pending_acks.is_empty());

        h.send(w, Message::heartbeat(3, 1.5).unwrap());
        let conn = h.coord.workers.get(w).unwrap();
        assert_eq!(conn.progress, 3);
        assert_eq!(conn.rate, Some(1.5));
    }

    #[test]
    fn instructions_describe_the_task() {
        let mut h = Harness::new("instructions");
        let w = h.subscribed_worker();
        let client = h.connect();
        submit(&mut h, client, "x\n");
        h.outbox(w);

        h.send(w, Message::empty(MessageType::JobReadyToReceive));
        let out = h.outbox(w);
        let instr = out[0].as_job_instructions().unwrap();
        assert_eq!(instr.kernel, "word_count");
        assert_eq!(instr.kind, common::TaskKind::Map);
        assert_eq!(instr.worker_count, 1);
        assert_eq!(instr.partition_index, 0);

        let data = out[1].text().unwrap();
        assert_eq!(std::fs::read_to_string(data).unwrap(), "x\n");
    }

    #[test]
    fn job_done_without_a_task_is_ignored() {
        let mut h = Harness::new("stray_done");
        let w = h.subscribed_worker();
        h.send(w, Message::job_done("/tmp/nada"));
        assert!(h.kinds(w).is_empty());
        assert_eq!(h.coord.workers.get(w).unwrap().state, WorkerState::Idle);
    }

    #[test]
    fn messages_from_removed_connections_are_dropped() {
        let mut h = Harness::new("removed");
        let w = h.subscribed_worker();
        h.coord.disconnect(w, "test").unwrap();
        h.send(w, Message::subscribe());
        assert!(!h.coord.workers.contains(w));
        assert_eq!(h.coord.take_evicted(), vec![w]);
    }

    /// Lleva a `w` hasta Running con la única tarea map del job.
    fn running_task(h: &mut Harness, w: u64) -> u64 {
        let client = h.connect();
        submit(h, client, "a b\n");
        let task = h.outbox(w)[0].as_task_id().unwrap();
        h.send(w, Message::empty(MessageType::JobReadyToReceive));
        h.send(w, Message::empty(MessageType::JobInstructionsFileAck));
        h.send(w, Message::empty(MessageType::DatafileAck));
        h.send(w, Message::empty(MessageType::JobStartAck));
        h.outbox(w);
        task
    }

    #[test]
    fn missing_result_evicts_the_worker() {
        let mut h = Harness::new("missing_result");
        let w = h.subscribed_worker();
        let task = running_task(&mut h, w);

        h.send(w, Message::job_done("/nonexistent/map-out"));
        assert!(!h.coord.workers.contains(w));
        assert_eq!(h.coord.take_evicted(), vec![w]);
        let t = h.coord.graph.get(task).unwrap();
        assert_eq!(t.status, TaskStatus::Ready);
        assert!(t.result.is_none());

        // otro worker la toma apenas se suscribe
        let other = h.connect();
        h.send(other, Message::subscribe());
        let out = h.outbox(other);
        assert_eq!(out.len(), 2);
        assert!(out[0].is(MessageType::SubscribeAck));
        assert_eq!(out[1].as_task_id().unwrap(), task);
    }

    #[test]
    fn unreadable_job_done_is_ignored() {
        let mut h = Harness::new("unreadable_done");
        let w = h.subscribed_worker();
        let task = running_task(&mut h, w);

        h.send(
            w,
            Message {
                kind: MessageType::JobDone,
                body: vec![0xff, 0xfe],
            },
        );
        assert!(h.kinds(w).is_empty());
        assert_eq!(h.coord.workers.get(w).unwrap().state, WorkerState::Running);
        assert_eq!(h.coord.graph.get(task).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn file_is_not_a_map_result() {
        let mut h = Harness::new("file_as_map_result");
        let w = h.subscribed_worker();
        let task = running_task(&mut h, w);

        let bogus = h.write_data("bogus.txt", "x\t1\n");
        h.send(w, Message::job_done(bogus.display().to_string()));
        assert!(!h.coord.workers.contains(w));
        assert_eq!(h.coord.graph.get(task).unwrap().status, TaskStatus::Ready);
    }

    #[test]
    fn start_ack_before_start_is_ignored() {
        let mut h = Harness::new("early_start_ack");
        let w = h.subscribed_worker();
        let client = h.connect();
        submit(&mut h, client, "a\n");
        let task = h.outbox(w)[0].as_task_id().unwrap();

        h.send(w, Message::empty(MessageType::JobStartAck));
        assert_eq!(h.coord.workers.get(w).unwrap().state, WorkerState::Assigned);
        assert_eq!(h.coord.graph.get(task).unwrap().status, TaskStatus::Assigned);

        // el handshake sigue normalmente
        h.send(w, Message::empty(MessageType::JobReadyToReceive));
        assert_eq!(
            h.kinds(w),
            vec![MessageType::JobInstructionsFile, MessageType::Datafile]
        );
    }

    #[test]
    fn repeated_start_ack_is_harmless() {
        let mut h = Harness::new("repeated_start_ack");
        let w = h.subscribed_worker();
        let task = running_task(&mut h, w);

        h.send(w, Message::empty(MessageType::JobStartAck));
        assert_eq!(h.coord.workers.get(w).unwrap().state, WorkerState::Running);
        assert_eq!(h.coord.graph.get(task).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn job_done_before_start_is_ignored() {
        let mut h = Harness::new("early_done");
        let w = h.subscribed_worker();
        let client = h.connect();
        submit(&mut h, client, "a\n");
        let task = h.outbox(w)[0].as_task_id().unwrap();

        h.send(w, Message::job_done("/tmp/nada"));
        assert!(h.kinds(w).is_empty());
        assert!(h.coord.workers.contains(w));
        assert_eq!(h.coord.workers.get(w).unwrap().state, WorkerState::Assigned);
        assert_eq!(h.coord.graph.get(task).unwrap().status, TaskStatus::Assigned);
    }
}
