use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

use crate::classfile::ClassDocument;
use crate::pass::{ClassPass, PassContext, ProcessorCallback};

/// Randomly permutes field and method order.
///
/// With a run seed each class gets its own generator derived from the seed
/// and the class name, so the result does not depend on which worker
/// handled the class.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShuffleMembers {
    seed: Option<u64>,
}

impl ShuffleMembers {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }

    fn rng_for(&self, class: &str) -> StdRng {
        match self.seed {
            Some(seed) => {
                let digest = Sha256::new()
                    .chain_update(seed.to_be_bytes())
                    .chain_update(class.as_bytes())
                    .finalize();
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&digest[..8]);
                StdRng::seed_from_u64(u64::from_be_bytes(bytes))
            }
            None => StdRng::from_entropy(),
        }
    }
}

impl ClassPass for ShuffleMembers {
    fn name(&self) -> &str {
        "shuffle-members"
    }

    fn process(&self, class: &mut ClassDocument, _: &PassContext<'_>, _: &mut ProcessorCallback) -> anyhow::Result<()> {
        let mut rng = self.rng_for(&class.name);
        class.fields.shuffle(&mut rng);
        class.methods.shuffle(&mut rng);
        Ok(())
    }
}
