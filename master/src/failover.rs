use std::time::Instant;

use tracing::{info, warn};

use common::{JobPhase, TaskKind, WorkerId};

use crate::coordinator::{CoordResult, Coordinator};

/// Los reduce reportan cada byte dos veces (lectura + reducción).
fn progress_multiplier(kind: TaskKind) -> f64 {
    match kind {
        TaskKind::Map => 1.0,
        TaskKind::Reduce => 2.0,
    }
}

impl Coordinator {
    /// Reenvía los pedidos vencidos; tras `max_ack_retries` reenvíos, el
    /// worker se da por muerto.
    pub(crate) fn check_ack_timeouts(&mut self, now: Instant) -> CoordResult {
        let timeout = self.config.ack_timeout;
        let max_retries = self.config.max_ack_retries;
        let mut dead: Vec<WorkerId> = Vec::new();

        for conn in self.workers.iter_mut() {
            let mut exhausted = false;
            let mut resend = Vec::new();
            for pending in conn.pending_acks.iter_mut() {
                if now < pending.deadline {
                    continue;
                }
                if pending.retries >= max_retries {
                    exhausted = true;
                    break;
                }
                pending.retries += 1;
                pending.deadline = now + timeout;
                resend.push((pending.message.clone(), pending.retries));
            }

            if exhausted {
                dead.push(conn.id);
                continue;
            }
            for (msg, retries) in resend {
                warn!(
                    worker = conn.id,
                    kind = ?msg.kind,
                    retries,
                    "ack vencido, reenviando"
                );
                conn.writer.send(&msg);
            }
        }

        for id in dead {
            self.evict(id, "sin ack tras los reintentos")?;
        }
        Ok(())
    }

    /// Un worker corriendo que deja de mandar heartbeats se da por muerto.
    pub(crate) fn check_heartbeats(&mut self, now: Instant) -> CoordResult {
        let limit = self.config.heartbeat_timeout;
        let silent: Vec<(WorkerId, u64)> = self
            .workers
            .iter()
            .filter(|w| w.is_running())
            .filter_map(|w| {
                let quiet = now.saturating_duration_since(w.last_heartbeat);
                (quiet > limit).then(|| (w.id, quiet.as_millis() as u64))
            })
            .collect();

        for (id, quiet_ms) in silent {
            warn!(worker = id, quiet_ms, "sin heartbeat");
            self.evict(id, "heartbeat vencido")?;
        }
        Ok(())
    }

    /// Compara al worker corriendo más lento con el libre más rápido. Si el
    /// libre terminaría la misma tarea desde cero antes (con margen), se la
    /// pasa y se cierra la conexión del lento.
    pub(crate) fn check_stragglers(&mut self, now: Instant) -> CoordResult {
        if !matches!(self.phase(), JobPhase::Mapping | JobPhase::Reducing) {
            return Ok(());
        }

        let fastest_idle = self
            .workers
            .iter()
            .filter(|w| w.is_idle())
            .filter_map(|w| w.rate.filter(|r| *r > 0.0).map(|r| (w.id, r)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        let slowest_running = self
            .workers
            .iter()
            .filter(|w| w.is_running())
            .filter_map(|w| w.rate.filter(|r| *r > 0.0).map(|r| (w.id, r)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let (Some((idle_id, _)), Some((slow_id, _))) = (fastest_idle, slowest_running) else {
            return Ok(());
        };
        let (Some(idle), Some(slow)) = (self.workers.get(idle_id), self.workers.get(slow_id))
        else {
            return Ok(());
        };
        let Some(task_id) = slow.task else {
            return Ok(());
        };
        let Some(task) = self.graph.get(task_id) else {
            return Ok(());
        };

        let total = progress_multiplier(task.kind) * slow.chunk_size as f64;
        let (Some(slow_est), Some(idle_est)) = (
            slow.estimated_completion(total, slow.progress),
            idle.estimated_completion(total, 0),
        ) else {
            return Ok(());
        };

        let slack = self.config.straggler_slack.as_secs_f64();
        if slow_est - idle_est <= slack {
            return Ok(());
        }

        info!(
            straggler = slow_id,
            replacement = idle_id,
            task = task_id,
            slow_est,
            idle_est,
            "straggler detectado, se reasigna la tarea"
        );

        // la tarea pasa directo al otro worker (pre_execute ya corrió)
        if let Some(slow) = self.workers.get_mut(slow_id) {
            slow.task = None;
        }
        self.graph.reassign(task_id, idle_id)?;
        self.hand_over(task_id, idle_id, now)?;
        self.evict(slow_id, "straggler reemplazado")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::coordinator::testkit::Harness;
    use common::{Message, MessageType, SubmitJob, TaskStatus, WorkerId};

    /// Un worker suscrito con una tarea map recién asignada (JOB_READY pendiente).
    fn assigned(h: &mut Harness, data: &str) -> (WorkerId, u64) {
        let w = h.subscribed_worker();
        let data = h.write_data("in.txt", data);
        let client = h.connect();
        h.send(
            client,
            Message::submit_job(&SubmitJob {
                mapper: "word_count".into(),
                reducer: "word_count".into(),
                data_path: data.display().to_string(),
            })
            .unwrap(),
        );
        let out = h.outbox(w);
        let task = out[0].as_task_id().unwrap();
        (w, task)
    }

    fn running(h: &mut Harness, w: WorkerId) {
        h.send(w, Message::empty(MessageType::JobReadyToReceive));
        h.send(w, Message::empty(MessageType::JobInstructionsFileAck));
        h.send(w, Message::empty(MessageType::DatafileAck));
        h.send(w, Message::empty(MessageType::JobStartAck));
        h.outbox(w);
    }

    #[test]
    fn unacked_request_is_resent_three_times_then_evicted_once() {
        let mut h = Harness::new("ack_retry");
        let (w, task) = assigned(&mut h, "a b\n");
        let ack = h.coord.config.ack_timeout;

        for attempt in 1..=3 {
            h.advance(ack);
            h.tick();
            let out = h.outbox(w);
            assert_eq!(out, vec![Message::job_ready(task)], "reenvío {attempt}");
            assert_eq!(h.coord.workers.get(w).unwrap().pending_acks[0].retries, attempt);
        }

        // cuarto vencimiento: muerto, tarea de vuelta a Ready
        h.advance(ack);
        h.coord.check_ack_timeouts(h.now).unwrap();
        assert!(!h.coord.workers.contains(w));
        assert_eq!(h.coord.take_evicted(), vec![w]);
        assert_eq!(h.coord.graph.get(task).unwrap().status, TaskStatus::Ready);
        assert_eq!(h.coord.graph.ready_unassigned(), vec![task]);

        // otro chequeo no vuelve a reencolar ni a remover nada
        h.advance(ack);
        h.tick();
        assert!(h.coord.take_evicted().is_empty());
        assert_eq!(h.coord.graph.counts().ready, 1);
    }

    #[test]
    fn nothing_is_resent_before_the_deadline() {
        let mut h = Harness::new("ack_early");
        let (w, _) = assigned(&mut h, "a\n");
        h.advance(h.coord.config.ack_timeout - Duration::from_millis(1));
        h.tick();
        assert!(h.outbox(w).is_empty());
    }

    #[test]
    fn requeued_task_goes_to_the_next_idle_worker() {
        let mut h = Harness::new("requeue");
        let (w, task) = assigned(&mut h, "a\n");
        h.coord.disconnect(w, "test").unwrap();

        // el reparto corre apenas se procesa el SUBSCRIBE
        let other = h.connect();
        h.send(other, Message::subscribe());
        assert_eq!(
            h.outbox(other),
            vec![
                Message::empty(MessageType::SubscribeAck),
                Message::job_ready(task)
            ]
        );
    }

    #[test]
    fn silent_running_worker_is_evicted() {
        let mut h = Harness::new("heartbeat");
        let (w, task) = assigned(&mut h, "a\n");
        running(&mut h, w);

        h.advance(Duration::from_secs(4));
        h.tick();
        assert!(h.coord.workers.contains(w));

        h.advance(Duration::from_secs(2));
        h.tick();
        assert!(!h.coord.workers.contains(w));
        assert_eq!(h.coord.graph.get(task).unwrap().status, TaskStatus::Ready);
    }

    #[test]
    fn heartbeats_keep_a_running_worker_alive() {
        let mut h = Harness::new("heartbeat_alive");
        let (w, _) = assigned(&mut h, "a\n");
        running(&mut h, w);
        for _ in 0..5 {
            h.advance(Duration::from_secs(3));
            h.send(w, Message::heartbeat(1, 1.0).unwrap());
            h.tick();
        }
        assert!(h.coord.workers.contains(w));
    }

    /// Dos workers: `slow` corre una tarea grande, `fast` está libre con
    /// un ritmo conocido de la misma fase.
    fn straggler_setup(h: &mut Harness, slow_rate: f64, fast_rate: f64) -> (WorkerId, WorkerId, u64) {
        let data: String = "palabra ".repeat(125) + "\n"; // 1001 bytes, una partición
        let (slow, task) = assigned(h, &data);
        running(h, slow);
        let fast = h.subscribed_worker();
        h.coord.workers.get_mut(fast).unwrap().rate = Some(fast_rate);
        h.send(slow, Message::heartbeat(0, slow_rate).unwrap());
        (slow, fast, task)
    }

    #[test]
    fn straggler_is_replaced_when_gap_exceeds_slack() {
        let mut h = Harness::new("straggler");
        // lento: 1001 / 10 = ~100s; rápido: 1001 / 1000 = ~1s
        let (slow, fast, task) = straggler_setup(&mut h, 10.0, 1000.0);
        h.outbox(fast);

        h.tick();
        assert!(!h.coord.workers.contains(slow));
        assert_eq!(h.coord.take_evicted(), vec![slow]);
        assert_eq!(h.coord.graph.get(task).unwrap().assigned_worker, Some(fast));
        assert_eq!(h.outbox(fast), vec![Message::job_ready(task)]);

        // no queda otro straggler: no se vuelve a disparar
        h.tick();
        assert!(h.coord.take_evicted().is_empty());
        assert!(h.coord.workers.contains(fast));
    }

    #[test]
    fn straggler_within_slack_is_left_alone() {
        let mut h = Harness::new("straggler_slack");
        // lento: ~5.0s; rápido: ~1.0s -> diferencia 4s < 5s de margen
        let (slow, fast, task) = straggler_setup(&mut h, 200.2, 1001.0);

        h.tick();
        assert!(h.coord.workers.contains(slow));
        assert!(h.coord.take_evicted().is_empty());
        assert_eq!(h.coord.graph.get(task).unwrap().assigned_worker, Some(slow));
        assert!(h.coord.workers.get(fast).unwrap().is_idle());
    }
}
