//! Smart-provisioning collaborators for KeyGuard.
//!
//! Three pieces turn a prose request into a ready-to-use, narrowly scoped
//! credential:
//!
//! - [`intent`]: extract `{service, action, resource, permissions}` from a
//!   prompt.
//! - [`provisioner`]: mint a restricted key for that intent from a master key.
//! - [`skill`]: render and save a markdown skill telling an agent how to use
//!   the resulting proxy session.
//!
//! The broker wires them together; each is a trait or plain type that can be
//! swapped out in tests.

pub mod error;
pub mod intent;
pub mod provisioner;
pub mod skill;

pub use error::{ProvisionError, Result};
pub use intent::{
    DEFAULT_INTENT_MODEL, DEFAULT_OPENAI_BASE_URL, Intent, IntentParser, OpenAiIntentParser,
};
pub use provisioner::{ProvisionedKey, Provisioner, STUB_KEY_LIFETIME_HOURS, StubProvisioner};
pub use skill::{DEFAULT_SKILLS_DIR, SESSION_TOKEN_PLACEHOLDER, SkillGenerator};
