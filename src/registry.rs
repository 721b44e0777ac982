//! Реестр подписок.
//!
//! Владеет [`Sublist`], таблицами `sid` каждой сессии и курсорами
//! round-robin для групп очередей.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use dashmap::DashMap;
use nexum_error::SubscriptionError;

use crate::{
    session::{Session, SessionKind},
    subject,
    sublist::{QueueMatch, Sublist, SublistResult, SublistStats},
};

/// Интерес, полученный с маршрута.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInterest {
    /// Сервер, на котором живёт исходная подписка.
    pub origin: Arc<str>,
    /// Идентификатор подписки, уникальный в пределах `origin`.
    pub rsid: Arc<str>,
}

/// Подписка сессии на шаблон субъекта.
pub struct Subscription {
    /// Глобально уникальный номер.
    pub id: u64,
    /// Идентификатор в пределах сессии-владельца.
    pub sid: Arc<str>,
    pub subject: Arc<str>,
    pub queue: Option<Arc<str>>,
    pub session_id: u64,
    pub kind: SessionKind,
    /// Заполнено для подписок, принадлежащих маршрутам.
    pub remote: Option<RemoteInterest>,
    owner: Weak<dyn Session>,
    max_msgs: AtomicU64,
    delivered: AtomicU64,
}

/// Результат учёта одной доставки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Доставить
    Deliver,
    /// Доставить и удалить подписку: достигнут лимит UNSUB
    Last,
    /// Лимит уже исчерпан, пропустить
    Expired,
}

/// Параметры новой подписки.
pub struct SubscribeRequest<'a> {
    pub subject: &'a str,
    pub queue: Option<&'a str>,
    pub sid: &'a str,
    pub remote: Option<RemoteInterest>,
}

/// Реестр подписок брокера.
pub struct Registry {
    sublist: Sublist<Subscription>,
    sids: DashMap<u64, HashMap<Arc<str>, Arc<Subscription>>>,
    next_id: AtomicU64,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Subscription {
    /// Сессия-владелец, если она ещё жива.
    pub fn owner(&self) -> Option<Arc<dyn Session>> {
        self.owner.upgrade()
    }

    /// Идентификатор для анонса `RS+`/`RS-` локальной подписки.
    pub fn route_sid(&self) -> String {
        format!("{}:{}", self.session_id, self.sid)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    pub fn max_msgs(&self) -> Option<u64> {
        match self.max_msgs.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Лимит доставок уже исчерпан.
    pub fn is_expired(&self) -> bool {
        self.max_msgs()
            .map(|max| self.delivered() >= max)
            .unwrap_or(false)
    }

    /// Учитывает одну доставку с учётом лимита автоотписки.
    pub fn record_delivery(&self) -> Delivery {
        let n = self.delivered.fetch_add(1, Ordering::AcqRel) + 1;
        match self.max_msgs() {
            None => Delivery::Deliver,
            Some(max) if n < max => Delivery::Deliver,
            Some(max) if n == max => Delivery::Last,
            Some(_) => Delivery::Expired,
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sublist: Sublist::new(),
            sids: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Регистрирует подписку сессии.
    pub fn subscribe(
        &self,
        owner: &Arc<dyn Session>,
        req: SubscribeRequest<'_>,
    ) -> Result<Arc<Subscription>, SubscriptionError> {
        if !subject::is_valid_subject(req.subject) {
            return Err(SubscriptionError::InvalidSubject {
                subject: req.subject.to_string(),
            });
        }
        if let Some(queue) = req.queue {
            if queue.is_empty() || queue.contains(char::is_whitespace) {
                return Err(SubscriptionError::InvalidSubject {
                    subject: req.subject.to_string(),
                });
            }
        }

        let session_id = owner.id();
        let mut table = self.sids.entry(session_id).or_default();
        if table.contains_key(req.sid) {
            return Err(SubscriptionError::DuplicateSid {
                sid: req.sid.to_string(),
            });
        }

        let sub = Arc::new(Subscription {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sid: Arc::from(req.sid),
            subject: Arc::from(req.subject),
            queue: req.queue.map(Arc::from),
            session_id,
            kind: owner.kind(),
            remote: req.remote,
            owner: Arc::downgrade(owner),
            max_msgs: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        });

        table.insert(sub.sid.clone(), sub.clone());
        self.sublist
            .insert(&sub.subject, sub.queue.as_deref(), sub.clone());
        drop(table);
        Ok(sub)
    }

    /// Удаляет подписку по `sid`.
    pub fn unsubscribe(
        &self,
        session_id: u64,
        sid: &str,
    ) -> Result<Arc<Subscription>, SubscriptionError> {
        let removed = self
            .sids
            .get_mut(&session_id)
            .and_then(|mut table| table.remove(sid));

        match removed {
            Some(sub) => {
                self.detach(&sub);
                Ok(sub)
            }
            None => Err(SubscriptionError::UnknownSid {
                sid: sid.to_string(),
            }),
        }
    }

    /// `UNSUB <sid> <max>`.
    ///
    /// Если `max` уже не больше числа доставок, подписка удаляется сразу и
    /// возвращается; иначе выставляется лимит и возвращается `None`.
    pub fn auto_unsubscribe(
        &self,
        session_id: u64,
        sid: &str,
        max: u64,
    ) -> Result<Option<Arc<Subscription>>, SubscriptionError> {
        let sub = self
            .get(session_id, sid)
            .ok_or_else(|| SubscriptionError::UnknownSid {
                sid: sid.to_string(),
            })?;

        if max == 0 || max <= sub.delivered() {
            return self.unsubscribe(session_id, sid).map(Some);
        }
        sub.max_msgs.store(max, Ordering::Release);
        Ok(None)
    }

    /// Удаляет конкретную подписку, если она всё ещё зарегистрирована.
    pub fn remove(
        &self,
        sub: &Arc<Subscription>,
    ) -> bool {
        let removed = self
            .sids
            .get_mut(&sub.session_id)
            .map(|mut table| {
                let current = table.get(&sub.sid).is_some_and(|c| Arc::ptr_eq(c, sub));
                if current {
                    table.remove(&sub.sid);
                }
                current
            })
            .unwrap_or(false);

        if removed {
            self.detach(sub);
        }
        removed
    }

    /// Удаляет все подписки сессии (при её закрытии).
    pub fn unsubscribe_all(
        &self,
        session_id: u64,
    ) -> Vec<Arc<Subscription>> {
        let Some((_, table)) = self.sids.remove(&session_id) else {
            return Vec::new();
        };
        let subs: Vec<Arc<Subscription>> = table.into_values().collect();
        for sub in &subs {
            self.detach(sub);
        }
        subs
    }

    /// Удаляет весь удалённый интерес сервера `origin`, через какой бы
    /// маршрут он ни пришёл.
    pub fn unsubscribe_origin(
        &self,
        origin: &str,
    ) -> Vec<Arc<Subscription>> {
        let mut removed = Vec::new();
        for mut table in self.sids.iter_mut() {
            table.value_mut().retain(|_, sub| {
                let hit = sub
                    .remote
                    .as_ref()
                    .is_some_and(|interest| &*interest.origin == origin);
                if hit {
                    removed.push(sub.clone());
                }
                !hit
            });
        }
        for sub in &removed {
            self.detach(sub);
        }
        removed
    }

    pub fn session_count(
        &self,
        session_id: u64,
    ) -> usize {
        self.sids.get(&session_id).map(|t| t.len()).unwrap_or(0)
    }

    pub fn match_subject(
        &self,
        subject: &str,
    ) -> Arc<SublistResult<Subscription>> {
        self.sublist.match_subject(subject)
    }

    /// Выбирает одного участника группы очереди по кругу.
    ///
    /// Курсор принадлежит результату сопоставления, поэтому группы с одним
    /// именем на разных субъектах обходятся независимо. `eligible` отсеивает участников, которым доставить нельзя (закрытые
    /// сессии, маршруты, уже получившие сообщение).
    pub fn pick_queue_member<F>(
        &self,
        group: &QueueMatch<Subscription>,
        eligible: F,
    ) -> Option<Arc<Subscription>>
    where
        F: Fn(&Subscription) -> bool,
    {
        let n = group.members.len();
        if n == 0 {
            return None;
        }

        let start = group.next_start() % n;
        (0..n)
            .map(|i| &group.members[(start + i) % n])
            .find(|m| !m.is_expired() && eligible(m))
            .cloned()
    }

    /// Обходит все подписки.
    pub fn for_each<F>(
        &self,
        mut f: F,
    ) where
        F: FnMut(&Arc<Subscription>),
    {
        self.sublist.for_each(|_, sub| f(sub));
    }

    pub fn count(&self) -> u64 {
        self.sublist.count()
    }

    pub fn stats(&self) -> SublistStats {
        self.sublist.stats()
    }

    fn get(
        &self,
        session_id: u64,
        sid: &str,
    ) -> Option<Arc<Subscription>> {
        self.sids
            .get(&session_id)
            .and_then(|table| table.get(sid).cloned())
    }

    fn detach(
        &self,
        sub: &Arc<Subscription>,
    ) {
        self.sublist
            .remove(&sub.subject, sub.queue.as_deref(), sub);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .field("queue", &self.queue)
            .field("session_id", &self.session_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Debug for Registry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Registry")
            .field("subscriptions", &self.count())
            .field("sessions", &self.sids.len())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
