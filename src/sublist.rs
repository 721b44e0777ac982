//! Индекс подписок по субъектам (Sublist).
//!
//! Дерево токенов: каждый узел хранит подписки, заканчивающиеся на нём, и три
//! вида рёбер: литеральные, `*` и `>`. Результаты сопоставления литеральных
//! субъектов кэшируются в ограниченном LRU.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;

use crate::subject::{self, FWC, PWC};

/// Максимальное количество закэшированных результатов.
pub const SUBLIST_CACHE_MAX: usize = 1024;

/// Результат сопоставления литерального субъекта.
///
/// Обычные подписки получают копию каждая; из каждой очереди доставка
/// идёт ровно одному участнику.
#[derive(Debug)]
pub struct SublistResult<T> {
    pub plain: Vec<Arc<T>>,
    pub queues: Vec<QueueMatch<T>>,
}

/// Совпавшие участники одной группы очереди.
///
/// Курсор кругового выбора живёт вместе с результатом, то есть отдельно
/// для каждого литерального субъекта. Начальная позиция случайна.
#[derive(Debug)]
pub struct QueueMatch<T> {
    pub name: Arc<str>,
    pub members: Vec<Arc<T>>,
    cursor: AtomicUsize,
}

/// Снимок статистики индекса.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SublistStats {
    pub num_subscriptions: u64,
    pub num_cache: u64,
    pub num_inserts: u64,
    pub num_removes: u64,
    pub num_matches: u64,
    pub cache_hit_rate: f64,
}

/// Индекс подписок.
pub struct Sublist<T> {
    root: RwLock<Node<T>>,
    cache: Option<Mutex<LruCache<Box<str>, Arc<SublistResult<T>>>>>,
    count: AtomicU64,
    inserts: AtomicU64,
    removes: AtomicU64,
    matches: AtomicU64,
    cache_hits: AtomicU64,
}

struct Node<T> {
    literal: HashMap<Box<str>, Node<T>>,
    pwc: Option<Box<Node<T>>>,
    fwc: Option<Box<Node<T>>>,
    plain: Vec<Arc<T>>,
    queues: HashMap<Arc<str>, Vec<Arc<T>>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl<T> SublistResult<T> {
    fn empty() -> Self {
        Self {
            plain: Vec::new(),
            queues: Vec::new(),
        }
    }

    /// Нет ни одного получателя.
    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.queues.is_empty()
    }

    /// Общее количество совпавших подписок (включая всех участников
    /// очередей).
    pub fn len(&self) -> usize {
        self.plain.len() + self.queues.iter().map(|q| q.members.len()).sum::<usize>()
    }
}

impl<T> QueueMatch<T> {
    pub fn new(
        name: Arc<str>,
        members: Vec<Arc<T>>,
    ) -> Self {
        Self {
            name,
            members,
            cursor: AtomicUsize::new(rand::thread_rng().gen()),
        }
    }

    /// Позиция, с которой начинается следующий выбор участника.
    pub fn next_start(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            literal: HashMap::new(),
            pwc: None,
            fwc: None,
            plain: Vec::new(),
            queues: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.literal.is_empty()
            && self.pwc.is_none()
            && self.fwc.is_none()
            && self.plain.is_empty()
            && self.queues.is_empty()
    }

    fn child_mut(
        &mut self,
        token: &str,
    ) -> &mut Node<T> {
        match token {
            PWC => self.pwc.get_or_insert_with(|| Box::new(Node::new())),
            FWC => self.fwc.get_or_insert_with(|| Box::new(Node::new())),
            _ => self.literal.entry(token.into()).or_insert_with(Node::new),
        }
    }

    fn add(
        &mut self,
        queue: Option<&str>,
        item: Arc<T>,
    ) {
        match queue {
            None => self.plain.push(item),
            Some(name) => self.queues.entry(Arc::from(name)).or_default().push(item),
        }
    }

    fn take(
        &mut self,
        queue: Option<&str>,
        item: &Arc<T>,
    ) -> bool {
        match queue {
            None => {
                let before = self.plain.len();
                self.plain.retain(|s| !Arc::ptr_eq(s, item));
                before != self.plain.len()
            }
            Some(name) => {
                let Some(members) = self.queues.get_mut(name) else {
                    return false;
                };
                let before = members.len();
                members.retain(|s| !Arc::ptr_eq(s, item));
                let found = before != members.len();
                if members.is_empty() {
                    self.queues.remove(name);
                }
                found
            }
        }
    }

    /// Удаляет подписку по пути токенов, возвращает `(найдена, узел пуст)`.
    fn remove(
        &mut self,
        tokens: &[&str],
        queue: Option<&str>,
        item: &Arc<T>,
    ) -> (bool, bool) {
        let Some((head, rest)) = tokens.split_first() else {
            let found = self.take(queue, item);
            return (found, self.is_empty());
        };

        let found = match *head {
            PWC => match self.pwc.as_mut() {
                Some(child) => {
                    let (found, empty) = child.remove(rest, queue, item);
                    if empty {
                        self.pwc = None;
                    }
                    found
                }
                None => false,
            },
            FWC => match self.fwc.as_mut() {
                Some(child) => {
                    let (found, empty) = child.remove(rest, queue, item);
                    if empty {
                        self.fwc = None;
                    }
                    found
                }
                None => false,
            },
            token => match self.literal.get_mut(token) {
                Some(child) => {
                    let (found, empty) = child.remove(rest, queue, item);
                    if empty {
                        self.literal.remove(token);
                    }
                    found
                }
                None => false,
            },
        };

        (found, self.is_empty())
    }

    fn collect_into(
        &self,
        plain: &mut Vec<Arc<T>>,
        queues: &mut HashMap<Arc<str>, Vec<Arc<T>>>,
    ) {
        plain.extend(self.plain.iter().cloned());
        for (name, members) in &self.queues {
            queues
                .entry(name.clone())
                .or_default()
                .extend(members.iter().cloned());
        }
    }

    fn match_tokens(
        &self,
        tokens: &[&str],
        plain: &mut Vec<Arc<T>>,
        queues: &mut HashMap<Arc<str>, Vec<Arc<T>>>,
    ) {
        // `>` требует хотя бы один оставшийся токен.
        if !tokens.is_empty() {
            if let Some(fwc) = &self.fwc {
                fwc.collect_into(plain, queues);
            }
        }

        let Some((head, rest)) = tokens.split_first() else {
            self.collect_into(plain, queues);
            return;
        };

        if let Some(child) = self.literal.get(*head) {
            child.match_tokens(rest, plain, queues);
        }
        if let Some(pwc) = &self.pwc {
            pwc.match_tokens(rest, plain, queues);
        }
    }

    fn visit_all<F>(
        &self,
        f: &mut F,
    ) where
        F: FnMut(Option<&Arc<str>>, &Arc<T>),
    {
        for s in &self.plain {
            f(None, s);
        }
        for (name, members) in &self.queues {
            for s in members {
                f(Some(name), s);
            }
        }
        for child in self.literal.values() {
            child.visit_all(f);
        }
        if let Some(pwc) = &self.pwc {
            pwc.visit_all(f);
        }
        if let Some(fwc) = &self.fwc {
            fwc.visit_all(f);
        }
    }
}

impl<T> Sublist<T> {
    /// Создаёт индекс с кэшем по умолчанию.
    pub fn new() -> Self {
        Self::with_cache_capacity(SUBLIST_CACHE_MAX)
    }

    /// Создаёт индекс с заданной ёмкостью кэша; `0` отключает кэш.
    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            root: RwLock::new(Node::new()),
            cache: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            count: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            matches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// Добавляет подписку под шаблон.
    ///
    /// Проверка валидности шаблона выполняется на уровне протокола.
    pub fn insert(
        &self,
        pattern: &str,
        queue: Option<&str>,
        item: Arc<T>,
    ) {
        let mut root = self.root.write();
        let mut node = &mut *root;
        for token in subject::tokens(pattern) {
            node = node.child_mut(token);
        }
        node.add(queue, item);

        self.count.fetch_add(1, Ordering::Relaxed);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.invalidate(pattern);
    }

    /// Удаляет подписку; возвращает `false`, если она не была найдена.
    pub fn remove(
        &self,
        pattern: &str,
        queue: Option<&str>,
        item: &Arc<T>,
    ) -> bool {
        let tokens: Vec<&str> = subject::tokens(pattern).collect();
        let mut root = self.root.write();
        let (found, _) = root.remove(&tokens, queue, item);

        if found {
            self.count.fetch_sub(1, Ordering::Relaxed);
            self.removes.fetch_add(1, Ordering::Relaxed);
            self.invalidate(pattern);
        }
        found
    }

    /// Находит все подписки, шаблон которых принимает литеральный субъект.
    pub fn match_subject(
        &self,
        literal: &str,
    ) -> Arc<SublistResult<T>> {
        self.matches.fetch_add(1, Ordering::Relaxed);

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get(literal) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return hit.clone();
            }
        }

        let tokens: Vec<&str> = subject::tokens(literal).collect();
        let root = self.root.read();

        let mut plain = Vec::new();
        let mut queues = HashMap::new();
        root.match_tokens(&tokens, &mut plain, &mut queues);

        let result = Arc::new(if plain.is_empty() && queues.is_empty() {
            SublistResult::empty()
        } else {
            SublistResult {
                plain,
                queues: queues
                    .into_iter()
                    .map(|(name, members)| QueueMatch::new(name, members))
                    .collect(),
            }
        });

        // Кэш пополняется под read-блокировкой дерева, иначе параллельная
        // запись могла бы оставить в нём устаревший результат.
        if let Some(cache) = &self.cache {
            cache.lock().put(literal.into(), result.clone());
        }
        drop(root);

        result
    }

    /// Количество подписок в индексе.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Количество закэшированных результатов.
    pub fn cache_len(&self) -> usize {
        self.cache.as_ref().map(|c| c.lock().len()).unwrap_or(0)
    }

    /// Обходит все подписки индекса.
    pub fn for_each<F>(
        &self,
        mut f: F,
    ) where
        F: FnMut(Option<&Arc<str>>, &Arc<T>),
    {
        self.root.read().visit_all(&mut f);
    }

    pub fn stats(&self) -> SublistStats {
        let matches = self.matches.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        SublistStats {
            num_subscriptions: self.count(),
            num_cache: self.cache_len() as u64,
            num_inserts: self.inserts.load(Ordering::Relaxed),
            num_removes: self.removes.load(Ordering::Relaxed),
            num_matches: matches,
            cache_hit_rate: if matches == 0 {
                0.0
            } else {
                hits as f64 / matches as f64
            },
        }
    }

    /// Вытесняет из кэша только субъекты, которые принимает шаблон.
    fn invalidate(
        &self,
        pattern: &str,
    ) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut cache = cache.lock();
        let stale: Vec<Box<str>> = cache
            .iter()
            .filter(|(subject, _)| subject::subject_matches(pattern, subject))
            .map(|(subject, _)| subject.clone())
            .collect();
        for subject in stale {
            cache.pop(&subject);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl<T> Default for Sublist<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Sublist<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Sublist")
            .field("count", &self.count())
            .field("cache", &self.cache_len())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
