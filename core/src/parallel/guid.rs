pub const LAYER_GUID_FIRST_VALID: u64 = 1_000_000;
pub const OP_GUID_FIRST_VALID: u64 = 2_000_000;
pub const TENSOR_GUID_FIRST_VALID: u64 = 3_000_000;
pub const PARALLEL_TENSOR_GUID_FIRST_VALID: u64 = 4_000_000;
pub const NODE_GUID_FIRST_VALID: u64 = 5_000_000;

/// Sequence state for every kind of guid handed out while a model is built.
/// Counters only move forward.
#[derive(Debug, Clone)]
pub struct GuidGenerator {
    layer: u64,
    op: u64,
    tensor: u64,
    parallel_tensor: u64,
    node: u64,
}

impl Default for GuidGenerator {
    fn default() -> Self {
        GuidGenerator::new()
    }
}

impl GuidGenerator {
    pub fn new() -> Self {
        Self {
            layer: LAYER_GUID_FIRST_VALID,
            op: OP_GUID_FIRST_VALID,
            tensor: TENSOR_GUID_FIRST_VALID,
            parallel_tensor: PARALLEL_TENSOR_GUID_FIRST_VALID,
            node: NODE_GUID_FIRST_VALID,
        }
    }

    fn bump(counter: &mut u64) -> u64 {
        let guid = *counter;
        *counter += 1;
        guid
    }

    pub fn next_layer(&mut self) -> u64 {
        Self::bump(&mut self.layer)
    }
    pub fn next_op(&mut self) -> u64 {
        Self::bump(&mut self.op)
    }
    pub fn next_tensor(&mut self) -> u64 {
        Self::bump(&mut self.tensor)
    }
    pub fn next_parallel_tensor(&mut self) -> u64 {
        Self::bump(&mut self.parallel_tensor)
    }
    pub fn next_node(&mut self) -> u64 {
        Self::bump(&mut self.node)
    }
}

#[test]
fn test_guid_counters_are_independent() -> anyhow::Result<()> {
    let mut guids = GuidGenerator::new();
    assert_eq!(guids.next_layer(), LAYER_GUID_FIRST_VALID);
    assert_eq!(guids.next_tensor(), TENSOR_GUID_FIRST_VALID);
    assert_eq!(guids.next_tensor(), TENSOR_GUID_FIRST_VALID + 1);
    assert_eq!(guids.next_op(), OP_GUID_FIRST_VALID);
    assert_eq!(guids.next_parallel_tensor(), PARALLEL_TENSOR_GUID_FIRST_VALID);
    assert_eq!(guids.next_node(), NODE_GUID_FIRST_VALID);
    assert_eq!(guids.next_layer(), LAYER_GUID_FIRST_VALID + 1);
    Ok(())
}
