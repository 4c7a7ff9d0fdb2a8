//! Maps a stage word (e.g. `tcp`, `grep`, `stdout`) to the constructor
//! that builds it, so the assembler can turn a parsed CLI token stream
//! into live `Stage` trait objects without a giant match statement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use super::options::StageOptions;
use super::Stage;

/// Builds a stage from its positional/flag arguments (already split by
/// the assembler) and returns it alongside the options it was declared
/// with, so the assembler can resolve direction and validate shape
/// before attach.
pub type FactoryFn = Arc<dyn Fn(&[String]) -> anyhow::Result<(Box<dyn Stage>, StageOptions)> + Send + Sync>;

/// Global table of stage words to factories. Concrete stage modules call
/// [`StageRegistry::register`] once, from an initializer invoked by
/// [`crate::stages::register_builtin_stages`]; the assembler only ever
/// reads it.
pub struct StageRegistry {
    factories: Mutex<HashMap<String, FactoryFn>>,
}

static REGISTRY: OnceLock<StageRegistry> = OnceLock::new();

impl StageRegistry {
    fn global() -> &'static StageRegistry {
        REGISTRY.get_or_init(|| StageRegistry {
            factories: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(word: &str, factory: FactoryFn) {
        Self::global()
            .factories
            .lock()
            .unwrap()
            .insert(word.to_string(), factory);
    }

    pub fn lookup(word: &str) -> Option<FactoryFn> {
        Self::global().factories.lock().unwrap().get(word).cloned()
    }

    pub fn words() -> Vec<String> {
        let mut words: Vec<String> = Self::global().factories.lock().unwrap().keys().cloned().collect();
        words.sort();
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::handle::{AttachHandle, RunHandle};

    struct Noop;

    #[async_trait::async_trait]
    impl Stage for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn attach(&mut self, _attach: &mut AttachHandle) -> anyhow::Result<()> {
            Ok(())
        }
        async fn prepare(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn run(&self, _run: RunHandle) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_then_lookup_roundtrips() {
        StageRegistry::register(
            "test-noop-roundtrip",
            Arc::new(|_args| Ok((Box::new(Noop) as Box<dyn Stage>, StageOptions::default()))),
        );
        assert!(StageRegistry::lookup("test-noop-roundtrip").is_some());
        assert!(StageRegistry::lookup("definitely-not-registered").is_none());
    }
}
