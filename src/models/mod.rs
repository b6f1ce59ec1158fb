//! Wire formats of the three backend generation APIs
//!
//! Only the fields the adapters read or write are modelled; everything a
//! caller passes through as a provider-specific extra is flattened into the
//! request bodies.

pub mod anthropic;
pub mod gemini;
pub mod openai;
