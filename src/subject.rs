//! Разбор и проверка субъектов.
//!
//! Субъект состоит из непустых токенов, разделённых точкой. В шаблонах
//! подписок допускаются `*` (ровно один токен) и `>` (один и более
//! оставшихся токенов, только последним).

/// Разделитель токенов.
pub const TSEP: char = '.';
/// Одиночный wildcard.
pub const PWC: &str = "*";
/// Хвостовой wildcard.
pub const FWC: &str = ">";

/// Итератор по токенам субъекта.
pub fn tokens(subject: &str) -> std::str::Split<'_, char> {
    subject.split(TSEP)
}

/// Проверяет, что токен не содержит пробельных символов и не пуст.
fn is_valid_token(token: &str) -> bool {
    !token.is_empty() && !token.bytes().any(|b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n')
}

/// Проверяет шаблон подписки.
///
/// Пустые токены запрещены, `>` допустим только последним токеном.
pub fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }

    let mut seen_fwc = false;
    for token in tokens(subject) {
        if seen_fwc || !is_valid_token(token) {
            return false;
        }
        if token == FWC {
            seen_fwc = true;
        }
    }
    true
}

/// Проверяет литеральный субъект публикации: валиден и не содержит
/// wildcard-токенов.
pub fn is_valid_literal_subject(subject: &str) -> bool {
    is_valid_subject(subject) && tokens(subject).all(|t| t != PWC && t != FWC)
}

/// Прямое сравнение шаблона с литеральным субъектом без дерева.
///
/// Используется для точечной инвалидации кэша `Sublist` и как эталон в
/// тестах.
pub fn subject_matches(
    pattern: &str,
    literal: &str,
) -> bool {
    let mut lit = tokens(literal);

    for pt in tokens(pattern) {
        if pt == FWC {
            return lit.next().is_some();
        }
        match lit.next() {
            Some(lt) if pt == PWC || pt == lt => {}
            _ => return false,
        }
    }

    lit.next().is_none()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("foo", true)]
    #[case("foo.bar.baz", true)]
    #[case("foo.*.baz", true)]
    #[case("foo.>", true)]
    #[case(">", true)]
    #[case("*", true)]
    #[case("", false)]
    #[case("foo..bar", false)]
    #[case(".foo", false)]
    #[case("foo.", false)]
    #[case("foo.>.bar", false)]
    #[case("foo bar", false)]
    fn test_is_valid_subject(
        #[case] subject: &str,
        #[case] valid: bool,
    ) {
        assert_eq!(is_valid_subject(subject), valid, "subject={subject:?}");
    }

    #[rstest]
    #[case("foo.bar", true)]
    #[case("foo.*", false)]
    #[case("foo.>", false)]
    #[case("foo*.bar", true)]
    fn test_is_valid_literal_subject(
        #[case] subject: &str,
        #[case] valid: bool,
    ) {
        assert_eq!(is_valid_literal_subject(subject), valid);
    }

    /// Тест проверяет базовую таблицу сопоставления для `a.b.c`.
    #[rstest]
    #[case("a.b.c", true)]
    #[case("a.*.c", true)]
    #[case("a.b.*", true)]
    #[case("a.>", true)]
    #[case(">", true)]
    #[case("*.*.*", true)]
    #[case("a.b", false)]
    #[case("a.b.c.d", false)]
    #[case("x.>", false)]
    #[case("a.b.c.>", false)]
    #[case("*.*", false)]
    fn test_subject_matches(
        #[case] pattern: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(subject_matches(pattern, "a.b.c"), expected, "pattern={pattern}");
    }
}
