/// A user of the multiplication service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub alias: String,
}

impl User {
    pub fn new(id: i64, alias: &str) -> Self {
        Self {
            id,
            alias: alias.to_owned(),
        }
    }
}

/// An attempt to solve a multiplication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeAttempt {
    pub id: i64,
    pub user: User,
    pub factor_a: i32,
    pub factor_b: i32,
    pub result_attempt: i32,
    pub correct: bool,
}

impl ChallengeAttempt {
    pub fn new(
        id: i64,
        user: User,
        factor_a: i32,
        factor_b: i32,
        result_attempt: i32,
        correct: bool,
    ) -> Self {
        Self {
            id,
            user,
            factor_a,
            factor_b,
            result_attempt,
            correct,
        }
    }

    /// Builds an attempt, checking the guess against the product of the factors
    pub fn verified(
        id: i64,
        user: User,
        factor_a: i32,
        factor_b: i32,
        result_attempt: i32,
    ) -> Self {
        let correct = factor_a
            .checked_mul(factor_b)
            .is_some_and(|product| product == result_attempt);

        Self::new(id, user, factor_a, factor_b, result_attempt, correct)
    }
}
