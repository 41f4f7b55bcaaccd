use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tokio::sync::Notify;

use crate::domain::error::QueueError;

/// キューから受け取った配信。ペイロードはジョブ ID だけ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: String,
    pub queue: String,
    /// ack に使う受領番号
    pub receipt: String,
    /// この配信が何回目か（1 始まり）
    pub delivery_count: u32,
}

/// プル型タスクキュー（at-least-once）。
///
/// 重複配信はありうる。ワーカーはストアから読み直し、クレームで重複を弾く。
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job_id: &str, queue: &str) -> Result<(), QueueError>;

    /// 次の配信を待つ。クローズ後は `Ok(None)`。
    async fn consume(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// 新規投入を止め、待機中の consume を解放する
    fn close(&self);
}

// ─── MemoryTaskQueue ─────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, VecDeque<String>>,
    closed: bool,
    next_receipt: u64,
}

/// プロセス内キュー。リースを持たないため、ack されなかった配信は再配信されない。
#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// キューに残っている件数
    pub fn depth(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }
}

#[async_trait::async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, job_id: &str, queue: &str) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(job_id.to_string());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        loop {
            // 状態確認より先に待機を登録して取りこぼしを防ぐ
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                let next = state.queues.get_mut(queue).and_then(VecDeque::pop_front);
                if let Some(job_id) = next {
                    state.next_receipt += 1;
                    return Ok(Some(Delivery {
                        job_id,
                        queue: queue.to_string(),
                        receipt: state.next_receipt.to_string(),
                        delivery_count: 1,
                    }));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        // 取り出した時点でキューから消えている
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}

// ─── SqliteTaskQueue ─────────────────────────────────────────────

/// SQLite テーブルを使うプロセス間キュー。
///
/// 取り出した配信はリース期間だけ不可視になり、ack されなければ再配信される。
pub struct SqliteTaskQueue {
    conn: Mutex<Connection>,
    lease: Duration,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl SqliteTaskQueue {
    pub fn open(path: &Path, lease: Duration, poll_interval: Duration) -> Result<Self, QueueError> {
        let conn = Connection::open(path)
            .map_err(|e| QueueError::Backend(format!("DB接続に失敗: {e}")))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| QueueError::Backend(format!("busy_timeout 設定失敗: {e}")))?;
        Self::with_connection(conn, lease, poll_interval)
    }

    /// in-memory DB（テスト用）
    pub fn open_in_memory(lease: Duration, poll_interval: Duration) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| QueueError::Backend(format!("in-memory DB作成に失敗: {e}")))?;
        Self::with_connection(conn, lease, poll_interval)
    }

    fn with_connection(
        conn: Connection,
        lease: Duration,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue_items (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                queue       TEXT NOT NULL,
                job_id      TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                visible_at  INTEGER NOT NULL,
                deliveries  INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_queue_visible
                ON queue_items(queue, visible_at);
            ",
        )
        .map_err(|e| QueueError::Backend(format!("マイグレーション失敗: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            lease,
            poll_interval,
            closed: AtomicBool::new(false),
        })
    }

    /// 可視な先頭アイテムをリースする
    fn try_lease(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| QueueError::Backend(format!("トランザクション開始失敗: {e}")))?;
        let row: Option<(i64, String, i64)> = tx
            .query_row(
                "SELECT id, job_id, deliveries FROM queue_items
                 WHERE queue = ?1 AND visible_at <= ?2
                 ORDER BY id LIMIT 1",
                params![queue, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| QueueError::Backend(format!("キュー読み取り失敗: {e}")))?;
        let Some((id, job_id, deliveries)) = row else {
            return Ok(None);
        };
        let visible_at = now.saturating_add(self.lease.as_millis() as i64);
        tx.execute(
            "UPDATE queue_items SET visible_at = ?1, deliveries = deliveries + 1 WHERE id = ?2",
            params![visible_at, id],
        )
        .map_err(|e| QueueError::Backend(format!("リース更新失敗: {e}")))?;
        tx.commit()
            .map_err(|e| QueueError::Backend(format!("コミット失敗: {e}")))?;
        Ok(Some(Delivery {
            job_id,
            queue: queue.to_string(),
            receipt: id.to_string(),
            delivery_count: deliveries as u32 + 1,
        }))
    }

    /// キューに残っている件数（リース中を含む）
    pub fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM queue_items WHERE queue = ?1",
                params![queue],
                |row| row.get(0),
            )
            .map_err(|e| QueueError::Backend(format!("件数取得失敗: {e}")))?;
        Ok(n as usize)
    }
}

#[async_trait::async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, job_id: &str, queue: &str) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let now = chrono::Utc::now().timestamp_millis();
        self.conn
            .lock()
            .execute(
                "INSERT INTO queue_items (queue, job_id, enqueued_at, visible_at) VALUES (?1, ?2, ?3, ?3)",
                params![queue, job_id, now],
            )
            .map_err(|e| QueueError::Backend(format!("投入失敗: {e}")))?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(delivery) = self.try_lease(queue)? {
                return Ok(Some(delivery));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let id: i64 = delivery
            .receipt
            .parse()
            .map_err(|_| QueueError::Backend(format!("不正な受領番号: {}", delivery.receipt)))?;
        self.conn
            .lock()
            .execute("DELETE FROM queue_items WHERE id = ?1", params![id])
            .map_err(|e| QueueError::Backend(format!("ack 失敗: {e}")))?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn memory_fifo_per_queue() {
        let q = MemoryTaskQueue::new();
        q.enqueue("j1", "synthesis").await.unwrap();
        q.enqueue("j2", "synthesis").await.unwrap();
        q.enqueue("j3", "other").await.unwrap();

        assert_eq!(q.consume("synthesis").await.unwrap().unwrap().job_id, "j1");
        assert_eq!(q.consume("synthesis").await.unwrap().unwrap().job_id, "j2");
        assert_eq!(q.depth("other"), 1);
    }

    #[tokio::test]
    async fn memory_consume_waits_for_enqueue() {
        let q = Arc::new(MemoryTaskQueue::new());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.consume("synthesis").await })
        };
        tokio::task::yield_now().await;
        q.enqueue("late", "synthesis").await.unwrap();
        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.job_id, "late");
    }

    #[tokio::test]
    async fn memory_close_releases_consumers() {
        let q = Arc::new(MemoryTaskQueue::new());
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.consume("synthesis").await })
        };
        tokio::task::yield_now().await;
        q.close();
        assert!(consumer.await.unwrap().unwrap().is_none());
        assert!(matches!(
            q.enqueue("j", "synthesis").await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn sqlite_ack_removes_item() {
        let q = SqliteTaskQueue::open_in_memory(Duration::from_secs(60), Duration::from_millis(5))
            .unwrap();
        q.enqueue("j1", "synthesis").await.unwrap();
        let d = q.consume("synthesis").await.unwrap().unwrap();
        assert_eq!(d.job_id, "j1");
        assert_eq!(d.delivery_count, 1);
        assert_eq!(q.depth("synthesis").unwrap(), 1);
        q.ack(&d).await.unwrap();
        assert_eq!(q.depth("synthesis").unwrap(), 0);
    }

    #[tokio::test]
    async fn sqlite_unacked_item_is_redelivered() {
        let q = SqliteTaskQueue::open_in_memory(Duration::ZERO, Duration::from_millis(5)).unwrap();
        q.enqueue("j1", "synthesis").await.unwrap();
        let first = q.consume("synthesis").await.unwrap().unwrap();
        let second = q.consume("synthesis").await.unwrap().unwrap();
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn sqlite_leased_item_is_invisible() {
        let q = SqliteTaskQueue::open_in_memory(Duration::from_secs(60), Duration::from_millis(5))
            .unwrap();
        q.enqueue("j1", "synthesis").await.unwrap();
        q.consume("synthesis").await.unwrap().unwrap();
        assert!(q.try_lease("synthesis").unwrap().is_none());
    }
}
