//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Events exchanged between the multiplication service (producer) and the gamification
// service (consumer).
//
// | Component               | Description                                                  |
// |-------------------------|--------------------------------------------------------------|
// | ChallengeAttempt        | Producer-side attempt the event is built from                |
// | ChallengeSolvedEvent    | Wire payload, JSON encoded, immutable                        |
// | ROUTING_KEY_*           | Routing keys derived from the attempt outcome                |
//--------------------------------------------------------------------------------------------------

mod attempt;
mod challenge_solved;

pub use attempt::{ChallengeAttempt, User};
pub use challenge_solved::ChallengeSolvedEvent;

/// Routing key of events for correct attempts. The only key bound to the consumer queue.
pub const ROUTING_KEY_CORRECT: &str = "attempt.correct";

/// Routing key of events for wrong attempts. Published, but nothing binds it.
pub const ROUTING_KEY_WRONG: &str = "attempt.wrong";
