use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{store::TenantStore, types::ChatStateSummary};

/// Cooldown applied when a human operator takes over a conversation.
pub const DEFAULT_SUSPEND: Duration = Duration::from_secs(60 * 60);

struct Pending {
    seq: u64,
    task: JoinHandle<()>,
}

struct Entry {
    bot_active: bool,
    last_activity: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    pending: Option<Pending>,
}

/// In-memory source of truth for whether the automated responder may act on
/// a conversation, keyed tenant -> chat handle. State is volatile and owned
/// by this process; a tenant logout drops everything for that tenant.
///
/// Map mutations are synchronous critical sections. The only await inside an
/// operation is the tenant-config read when a conversation is first seen, so
/// a get-then-set inside one handler is atomic relative to other synchronous
/// code but not across that initial fetch. Last write wins.
pub struct ChatStateRegistry {
    store: Arc<dyn TenantStore>,
    chats: Mutex<HashMap<String, HashMap<String, Entry>>>,
    timer_seq: AtomicU64,
}

impl ChatStateRegistry {
    pub fn new(store: Arc<dyn TenantStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            chats: Mutex::new(HashMap::new()),
            timer_seq: AtomicU64::new(0),
        })
    }

    /// Make sure the (tenant, chat) entry exists, seeding a new one from the
    /// tenant's global bot config. Touches `last_activity` on every call and
    /// drops a stray pending timer found on an already-active chat.
    async fn ensure(&self, tenant_id: &str, chat_id: &str) {
        {
            let mut chats = self.chats.lock();
            if let Some(entry) = chats
                .get_mut(tenant_id)
                .and_then(|tenant| tenant.get_mut(chat_id))
            {
                entry.last_activity = Utc::now();
                if entry.bot_active {
                    // Invariant: an active chat never has a timer armed.
                    if let Some(pending) = entry.pending.take() {
                        pending.task.abort();
                        debug!(tenant_id, chat_id, "dropped stray reactivation timer");
                    }
                }
                return;
            }
        }

        let default_active = self.store.bot_config(tenant_id).await;

        let mut chats = self.chats.lock();
        let tenant = chats.entry(tenant_id.to_string()).or_default();
        let now = Utc::now();
        // Another handler may have initialized the chat while the config
        // read was in flight; keep whatever landed first.
        let entry = tenant.entry(chat_id.to_string()).or_insert_with(|| {
            info!(
                tenant_id,
                chat_id, default_active, "initialized conversation state"
            );
            Entry {
                bot_active: default_active,
                last_activity: now,
                last_modified: now,
                pending: None,
            }
        });
        entry.last_activity = now;
    }

    pub async fn is_bot_active(&self, tenant_id: &str, chat_id: &str) -> bool {
        self.ensure(tenant_id, chat_id).await;
        let chats = self.chats.lock();
        chats
            .get(tenant_id)
            .and_then(|tenant| tenant.get(chat_id))
            .map(|entry| entry.bot_active)
            .unwrap_or(true)
    }

    /// Set the bot state for a chat, cancelling any armed reactivation timer
    /// first. Suspending with `auto_reactivate` arms a one-shot timer that
    /// flips the chat back to active after `duration`. Idempotent: repeating
    /// the same `active` value simply re-arms or disarms the timer.
    pub async fn set_bot_state(
        self: &Arc<Self>,
        tenant_id: &str,
        chat_id: &str,
        active: bool,
        auto_reactivate: bool,
        duration: Duration,
    ) -> bool {
        self.ensure(tenant_id, chat_id).await;

        // The replacement timer is spawned before taking the lock; it only
        // sleeps until installed, so a lost race just aborts it below.
        let pending = if !active && auto_reactivate {
            let seq = self.timer_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let registry = Arc::clone(self);
            let tenant = tenant_id.to_string();
            let chat = chat_id.to_string();
            let task = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                registry.reactivate_due(&tenant, &chat, seq);
            });
            Some(Pending { seq, task })
        } else {
            None
        };

        let mut chats = self.chats.lock();
        match chats
            .get_mut(tenant_id)
            .and_then(|tenant| tenant.get_mut(chat_id))
        {
            Some(entry) => {
                if let Some(old) = entry.pending.take() {
                    old.task.abort();
                }
                entry.bot_active = active;
                entry.last_modified = Utc::now();
                entry.pending = pending;
                info!(tenant_id, chat_id, active, auto_reactivate, "bot state set");
            }
            None => {
                // Entry vanished between ensure and here (tenant logout).
                if let Some(pending) = pending {
                    pending.task.abort();
                }
            }
        }
        active
    }

    /// Timer body: applies the deferred reactivation only if this timer is
    /// still the one the conversation is waiting on.
    fn reactivate_due(&self, tenant_id: &str, chat_id: &str, seq: u64) {
        let mut chats = self.chats.lock();
        let Some(entry) = chats
            .get_mut(tenant_id)
            .and_then(|tenant| tenant.get_mut(chat_id))
        else {
            return;
        };
        match &entry.pending {
            Some(pending) if pending.seq == seq => {}
            // Superseded or cancelled while this task was waking up.
            _ => return,
        }
        entry.pending = None;
        entry.bot_active = true;
        entry.last_modified = Utc::now();
        info!(tenant_id, chat_id, "bot auto-reactivated after takeover window");
    }

    /// Flip the bot state. Auto-reactivation applies only when the flip
    /// lands on inactive.
    pub async fn toggle_bot_state(
        self: &Arc<Self>,
        tenant_id: &str,
        chat_id: &str,
        auto_reactivate: bool,
    ) -> bool {
        let next = !self.is_bot_active(tenant_id, chat_id).await;
        self.set_bot_state(
            tenant_id,
            chat_id,
            next,
            auto_reactivate && !next,
            DEFAULT_SUSPEND,
        )
        .await
    }

    /// Force the bot back on, cancelling any scheduled reactivation. No-op
    /// when already active; always leaves the chat active.
    pub async fn manual_reactivate(self: &Arc<Self>, tenant_id: &str, chat_id: &str) -> bool {
        if self.is_bot_active(tenant_id, chat_id).await {
            return true;
        }
        self.set_bot_state(tenant_id, chat_id, true, false, DEFAULT_SUSPEND)
            .await
    }

    /// Snapshot of every tracked conversation for a tenant.
    pub fn list_conversations(&self, tenant_id: &str) -> Vec<ChatStateSummary> {
        let chats = self.chats.lock();
        chats
            .get(tenant_id)
            .map(|tenant| {
                tenant
                    .iter()
                    .map(|(chat_id, entry)| ChatStateSummary {
                        conversation: chat_id.clone(),
                        bot_active: entry.bot_active,
                        last_activity: entry.last_activity.to_rfc3339(),
                        last_modified: entry.last_modified.to_rfc3339(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop all conversation state for a tenant, aborting armed timers.
    /// Called when the tenant's WhatsApp session is torn down.
    pub fn purge_tenant(&self, tenant_id: &str) {
        let mut chats = self.chats.lock();
        if let Some(tenant) = chats.remove(tenant_id) {
            for (_, entry) in tenant {
                if let Some(pending) = entry.pending {
                    pending.task.abort();
                }
            }
            info!(tenant_id, "purged conversation state");
        }
    }
}
