pub mod evaluator;
pub mod review_session;
pub mod scoring_provider;
pub mod speaking;
pub mod srs;
pub mod weak_words;
