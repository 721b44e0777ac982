use std::sync::Arc;

use nexum::{subject::subject_matches, Sublist};
use proptest::prelude::*;

fn token() -> impl Strategy<Value = String> {
    prop_oneof![Just("a"), Just("b"), Just("c")].prop_map(str::to_string)
}

fn literal() -> impl Strategy<Value = String> {
    prop::collection::vec(token(), 1..5).prop_map(|t| t.join("."))
}

/// Шаблон: литеральные токены и `*`, возможно с `>` в конце.
fn pattern() -> impl Strategy<Value = String> {
    (
        prop::collection::vec(
            prop_oneof![3 => token(), 1 => Just("*".to_string())],
            1..4,
        ),
        any::<bool>(),
    )
        .prop_map(|(mut tokens, fwc)| {
            if fwc {
                tokens.push(">".to_string());
            }
            tokens.join(".")
        })
}

fn brute_force(
    patterns: &[String],
    literal: &str,
) -> Vec<usize> {
    patterns
        .iter()
        .enumerate()
        .filter(|(_, p)| subject_matches(p, literal))
        .map(|(i, _)| i)
        .collect()
}

fn tree_match(
    sublist: &Sublist<usize>,
    literal: &str,
) -> Vec<usize> {
    let mut found: Vec<usize> = sublist
        .match_subject(literal)
        .plain
        .iter()
        .map(|i| **i)
        .collect();
    found.sort_unstable();
    found
}

proptest! {
    /// Тест проверяет, что дерево находит ровно те шаблоны, которые
    /// принимает прямое сравнение.
    #[test]
    fn test_tree_matches_brute_force(
        patterns in prop::collection::vec(pattern(), 0..20),
        literals in prop::collection::vec(literal(), 1..10),
    ) {
        let sublist = Sublist::new();
        for (i, p) in patterns.iter().enumerate() {
            sublist.insert(p, None, Arc::new(i));
        }
        for literal in &literals {
            // Второй проход идёт через кэш.
            prop_assert_eq!(tree_match(&sublist, literal), brute_force(&patterns, literal));
            prop_assert_eq!(tree_match(&sublist, literal), brute_force(&patterns, literal));
        }
    }

    /// Тест проверяет, что после удаления части подписок результаты
    /// совпадают с набором оставшихся шаблонов, а удаление всех
    /// возвращает пустое дерево.
    #[test]
    fn test_insert_remove_round_trip(
        patterns in prop::collection::vec(pattern(), 1..20),
        keep in prop::collection::vec(any::<bool>(), 20),
        literals in prop::collection::vec(literal(), 1..10),
    ) {
        let sublist = Sublist::new();
        let items: Vec<Arc<usize>> = (0..patterns.len()).map(Arc::new).collect();
        for (p, item) in patterns.iter().zip(&items) {
            sublist.insert(p, None, item.clone());
        }
        // Прогрев кэша до удаления.
        for literal in &literals {
            let _ = sublist.match_subject(literal);
        }

        let mut remaining = Vec::new();
        for (i, (p, item)) in patterns.iter().zip(&items).enumerate() {
            if keep[i] {
                remaining.push(i);
            } else {
                prop_assert!(sublist.remove(p, None, item));
            }
        }
        prop_assert_eq!(sublist.count(), remaining.len() as u64);

        for literal in &literals {
            let expected: Vec<usize> = brute_force(&patterns, literal)
                .into_iter()
                .filter(|i| keep[*i])
                .collect();
            prop_assert_eq!(tree_match(&sublist, literal), expected);
        }

        for i in remaining {
            prop_assert!(sublist.remove(&patterns[i], None, &items[i]));
        }
        prop_assert_eq!(sublist.count(), 0);
        for literal in &literals {
            prop_assert!(sublist.match_subject(literal).is_empty());
        }
    }
}
