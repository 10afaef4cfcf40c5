use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::publisher::routing_key_for;

use super::ChallengeAttempt;

/// Event emitted every time a user submits an attempt, correct or not.
///
/// Serialized as a flat JSON object:
///
/// ```json
/// {"attemptId":1,"correct":true,"factorA":30,"factorB":40,"userId":10,"userAlias":"john"}
/// ```
///
/// Fields are private and there is no `Default`: an event only exists with all six
/// values, either from [`ChallengeSolvedEvent::new`] or from a complete payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSolvedEvent {
    attempt_id: i64,
    correct: bool,
    factor_a: i32,
    factor_b: i32,
    user_id: i64,
    user_alias: String,
}

impl ChallengeSolvedEvent {
    pub fn new(
        attempt_id: i64,
        correct: bool,
        factor_a: i32,
        factor_b: i32,
        user_id: i64,
        user_alias: &str,
    ) -> Self {
        Self {
            attempt_id,
            correct,
            factor_a,
            factor_b,
            user_id,
            user_alias: user_alias.to_owned(),
        }
    }

    pub fn attempt_id(&self) -> i64 {
        self.attempt_id
    }

    pub fn is_correct(&self) -> bool {
        self.correct
    }

    pub fn factor_a(&self) -> i32 {
        self.factor_a
    }

    pub fn factor_b(&self) -> i32 {
        self.factor_b
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn user_alias(&self) -> &str {
        &self.user_alias
    }

    /// `attempt.correct` or `attempt.wrong`, depending on the outcome
    pub fn routing_key(&self) -> &'static str {
        routing_key_for(self.correct)
    }

    /// Encodes the event as a UTF-8 JSON object
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an event, failing if the payload is not JSON or any field is missing
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl From<&ChallengeAttempt> for ChallengeSolvedEvent {
    fn from(attempt: &ChallengeAttempt) -> Self {
        Self::new(
            attempt.id,
            attempt.correct,
            attempt.factor_a,
            attempt.factor_b,
            attempt.user.id,
            &attempt.user.alias,
        )
    }
}
