use thiserror::Error;

/// Failures of the modelling core. Gate failures are not errors; see `gates::GateReport`.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("insufficient calibration rows: need at least {needed}, have {got}")]
    InsufficientRows { needed: usize, got: usize },

    #[error(
        "team {team} has neither game-level nor season-level stats (season {season}, game {game_id})"
    )]
    MissingTeamStats {
        team: String,
        season: i32,
        game_id: u64,
    },

    #[error("no walk-forward week had at least {min_train_rows} training rows")]
    NoWalkForwardWeeks { min_train_rows: usize },

    #[error("every feature was dropped before fitting")]
    NoUsableFeatures,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
}

pub type ModelResult<T> = Result<T, ModelError>;
