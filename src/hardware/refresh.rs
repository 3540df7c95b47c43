use crate::hardware::{HardwareNode, SensorProvider};
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

/// Refreshes every node of the tree, parents before children.
///
/// A node that fails or panics while refreshing keeps its previous readings;
/// its children and siblings are still visited. Returns the number of nodes
/// that failed.
pub fn refresh_tree(provider: &mut dyn SensorProvider, roots: &mut [HardwareNode]) -> usize {
    let mut failed = 0;
    for node in roots.iter_mut() {
        failed += refresh_node(provider, node);
    }
    failed
}

fn refresh_node(provider: &mut dyn SensorProvider, node: &mut HardwareNode) -> usize {
    let mut failed = 0;
    match panic::catch_unwind(AssertUnwindSafe(|| provider.refresh(node))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(
                error = %err,
                identifier = %node.identifier,
                category = node.category.as_str(),
                "не удалось обновить узел, пропускаем"
            );
            failed += 1;
        }
        Err(_) => {
            warn!(
                identifier = %node.identifier,
                category = node.category.as_str(),
                "паника при обновлении узла, пропускаем"
            );
            failed += 1;
        }
    }
    for child in node.children.iter_mut() {
        failed += refresh_node(provider, child);
    }
    failed
}
