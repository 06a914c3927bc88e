//! Control flow graph of one devirtualized export.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write,
};

use crate::{
    analysis::{
        cfg::{
            block::{ends_path, BasicBlock},
            CfgEdge, CfgEdgeKind,
        },
        ExceptionHandlerFrame, InferenceResult,
    },
    disassembler::VmInstruction,
    utils::{
        escape_dot,
        graph::{dfs, reverse_postorder, DirectedGraph, EdgeId, NodeId, Predecessors, Successors},
    },
    vm::FlowControl,
    Error::GraphError,
    Result,
};

/// Builds the control flow graph of an inference result.
///
/// # Errors
/// See [`ControlFlowGraph::build`].
pub fn build_graph(result: &InferenceResult) -> Result<ControlFlowGraph> {
    ControlFlowGraph::build(
        result.export_id,
        result.entry,
        result.instructions.values().cloned(),
        &result.block_headers,
        &result.eh_frames,
    )
}

/// The control flow graph of one export.
///
/// Nodes are [`BasicBlock`]s in ascending offset order, so node ids and offsets sort the
/// same way. Edges carry a [`CfgEdge`]. `CALL` and `RET` contribute no edges: a call
/// continues at the next instruction of the caller, and a return ends the path.
///
/// The graph is immutable once built.
#[derive(Debug)]
pub struct ControlFlowGraph {
    export_id: u32,
    graph: DirectedGraph<BasicBlock, CfgEdge>,
    entry: NodeId,
    exits: Vec<NodeId>,
    starts: BTreeMap<u64, NodeId>,
}

impl ControlFlowGraph {
    /// Partitions `instructions` into blocks and connects them.
    ///
    /// A block starts at `entry`, at every offset in `headers`, after an instruction that
    /// ends its path (jumps, `RET`, `EXIT`, `THROW`) and wherever the offsets are not
    /// contiguous. The order of `instructions` does not matter.
    ///
    /// # Errors
    /// Returns [`crate::Error::GraphError`] if there are no instructions, the entry offset
    /// was never decoded, or a resolved jump target or handler is not the start of a block.
    pub fn build(
        export_id: u32,
        entry: u64,
        instructions: impl IntoIterator<Item = VmInstruction>,
        headers: &BTreeSet<u64>,
        eh_frames: &[ExceptionHandlerFrame],
    ) -> Result<Self> {
        let mut sorted: Vec<VmInstruction> = instructions.into_iter().collect();
        if sorted.is_empty() {
            return Err(GraphError(format!(
                "export {export_id} has no instructions"
            )));
        }
        sorted.sort_by_key(|instruction| instruction.offset);
        sorted.dedup_by_key(|instruction| instruction.offset);

        let mut blocks: Vec<BasicBlock> = Vec::new();
        for instruction in sorted {
            let starts_block = match blocks.last() {
                None => true,
                Some(block) => {
                    instruction.offset == entry
                        || headers.contains(&instruction.offset)
                        || block.end() != instruction.offset
                        || block.terminator().is_some_and(ends_path)
                }
            };
            if starts_block {
                blocks.push(BasicBlock::new(instruction.offset));
            }
            if let Some(block) = blocks.last_mut() {
                block.instructions.push(instruction);
            }
        }

        let mut graph = DirectedGraph::new();
        let mut starts = BTreeMap::new();
        for block in blocks {
            let offset = block.offset;
            starts.insert(offset, graph.add_node(block));
        }

        let entry = *starts.get(&entry).ok_or_else(|| {
            GraphError(format!(
                "entry 0x{entry:08x} of export {export_id} was not decoded"
            ))
        })?;

        let mut cfg = ControlFlowGraph {
            export_id,
            graph,
            entry,
            exits: Vec::new(),
            starts,
        };
        cfg.connect()?;
        cfg.connect_handlers(eh_frames)?;

        cfg.exits = cfg
            .node_ids()
            .filter(|&node| {
                cfg.graph.out_degree(node) == 0
                    || cfg.block(node).is_some_and(BasicBlock::is_return)
            })
            .collect();

        Ok(cfg)
    }

    fn node_at(&self, offset: u64, what: &str) -> Result<NodeId> {
        self.starts.get(&offset).copied().ok_or_else(|| {
            GraphError(format!(
                "{what} 0x{offset:08x} of export {} does not start a block",
                self.export_id
            ))
        })
    }

    fn connect(&mut self) -> Result<()> {
        let mut edges = Vec::new();

        for (source, block) in self.graph.nodes() {
            let Some(last) = block.terminator() else {
                continue;
            };

            match last.flow() {
                FlowControl::Jump | FlowControl::ConditionalJump | FlowControl::Switch => {
                    for (index, &target) in last.jump_targets().iter().enumerate() {
                        let node = self.node_at(target, "jump target")?;
                        edges.push((source, node, CfgEdge::arm(target, index)));
                    }
                }
                _ if ends_path(last) => {}
                _ => {
                    let next = block.end();
                    if let Some(&node) = self.starts.get(&next) {
                        edges.push((source, node, CfgEdge::fallthrough(next)));
                    }
                }
            }
        }

        for (source, target, edge) in edges {
            self.graph.add_edge(source, target, edge)?;
        }
        Ok(())
    }

    fn connect_handlers(&mut self, eh_frames: &[ExceptionHandlerFrame]) -> Result<()> {
        for frame in eh_frames {
            let source = self.block_at(frame.try_start).ok_or_else(|| {
                GraphError(format!(
                    "TRY at 0x{:08x} of export {} was not decoded",
                    frame.try_start, self.export_id
                ))
            })?;

            let kind = CfgEdgeKind::ExceptionHandler { kind: frame.kind };
            for target in frame.filter.into_iter().chain([frame.handler]) {
                let node = self.node_at(target, "handler")?;
                self.graph.add_edge(source, node, CfgEdge::new(target, kind))?;
            }
        }
        Ok(())
    }

    /// Export id this graph belongs to.
    #[must_use]
    pub const fn export_id(&self) -> u32 {
        self.export_id
    }

    /// The block holding the export's entry.
    #[must_use]
    pub const fn entry(&self) -> NodeId {
        self.entry
    }

    /// Blocks without successors or ending in `RET`.
    #[must_use]
    pub fn exits(&self) -> &[NodeId] {
        &self.exits
    }

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// The block with id `node`.
    #[must_use]
    pub fn block(&self, node: NodeId) -> Option<&BasicBlock> {
        self.graph.node(node)
    }

    /// The block containing `offset`.
    #[must_use]
    pub fn block_at(&self, offset: u64) -> Option<NodeId> {
        let (_, &node) = self.starts.range(..=offset).next_back()?;
        self.block(node)
            .is_some_and(|block| block.contains(offset))
            .then_some(node)
    }

    /// Blocks in ascending offset order.
    pub fn blocks(&self) -> impl Iterator<Item = (NodeId, &BasicBlock)> {
        self.graph.nodes()
    }

    /// All node ids in ascending offset order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.block_count()).map(NodeId::new)
    }

    /// Successor blocks of `node` in edge order.
    pub fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.successors(node)
    }

    /// Predecessor blocks of `node`.
    pub fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.predecessors(node)
    }

    /// Outgoing edges of `node` as `(edge id, target, edge)`.
    pub fn outgoing_edges(&self, node: NodeId) -> impl Iterator<Item = (EdgeId, NodeId, &CfgEdge)> {
        self.graph.outgoing_edges(node)
    }

    /// Blocks reachable from the entry in depth-first order.
    pub fn dfs(&self) -> impl Iterator<Item = NodeId> + '_ {
        dfs(&self.graph, self.entry)
    }

    /// Blocks reachable from the entry in reverse postorder.
    #[must_use]
    pub fn reverse_postorder(&self) -> Vec<NodeId> {
        reverse_postorder(&self.graph, self.entry)
    }

    /// The underlying graph.
    #[must_use]
    pub fn graph(&self) -> &DirectedGraph<BasicBlock, CfgEdge> {
        &self.graph
    }

    /// Renders the graph in Graphviz DOT format.
    ///
    /// ```bash
    /// dot -Tpng export.dot -o export.png
    /// ```
    #[must_use]
    pub fn to_dot(&self, title: Option<&str>) -> String {
        let mut dot = String::new();

        dot.push_str("digraph CFG {\n");
        if let Some(name) = title {
            let _ = writeln!(dot, "    label=\"{}\";", escape_dot(name));
        }
        dot.push_str("    labelloc=t;\n");
        dot.push_str("    node [shape=box, fontname=\"Courier\", fontsize=10];\n");
        dot.push_str("    edge [fontname=\"Courier\", fontsize=9];\n\n");

        for (node, block) in self.blocks() {
            let is_entry = node == self.entry;
            let is_exit = self.exits.contains(&node);

            let mut label = format!("loc_{:04x}", block.offset);
            if is_entry {
                label.push_str(" (entry)");
            }
            if is_exit {
                label.push_str(" (exit)");
            }
            label.push_str("\\l");
            for instruction in &block.instructions {
                let _ = write!(label, "{}\\l", escape_dot(&instruction.to_string()));
            }

            let style = if is_entry {
                ", style=filled, fillcolor=lightgreen"
            } else if is_exit {
                ", style=filled, fillcolor=lightcoral"
            } else {
                ""
            };
            let _ = writeln!(dot, "    B{} [label=\"{label}\"{style}];", node.index());
        }

        dot.push('\n');

        for node in self.node_ids() {
            for (_, target, edge) in self.outgoing_edges(node) {
                let color = match edge.kind() {
                    CfgEdgeKind::Fallthrough => "black",
                    CfgEdgeKind::JumpArm { .. } => "blue",
                    CfgEdgeKind::ExceptionHandler { .. } => "purple",
                };
                let _ = writeln!(
                    dot,
                    "    B{} -> B{} [label=\"{}\", color={color}];",
                    node.index(),
                    target.index(),
                    escape_dot(&edge.kind().to_string())
                );
            }
        }

        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::ProgramState,
        disassembler::{Annotation, JumpAnnotation, VmOperand},
        vm::{EhType, VmOpCode},
    };

    fn op(offset: u64, opcode: VmOpCode) -> VmInstruction {
        let operand = match opcode.info().operand {
            crate::vm::OperandKind::Dword => VmOperand::Dword(0),
            _ => VmOperand::None,
        };
        VmInstruction::new(offset, 0, opcode, operand)
    }

    fn jump(offset: u64, opcode: VmOpCode, targets: &[u64]) -> VmInstruction {
        let mut instruction = op(offset, opcode);
        instruction.annotation = Some(Annotation::Jump(JumpAnnotation {
            targets: targets.to_vec(),
        }));
        instruction
    }

    /// ```text
    /// 00 PUSHI      06 PUSHI      0c JZ -> 1a, 0e
    /// 0e PUSHI      14 RET
    /// 16 NOP        18 NOP (gap after RET, unreachable)
    /// 1a PUSHI      20 RET
    /// ```
    fn diamond() -> Vec<VmInstruction> {
        vec![
            op(0x00, VmOpCode::PushiDword),
            op(0x06, VmOpCode::PushiDword),
            jump(0x0c, VmOpCode::Jz, &[0x1a, 0x0e]),
            op(0x0e, VmOpCode::PushiDword),
            op(0x14, VmOpCode::Ret),
            op(0x1a, VmOpCode::PushiDword),
            op(0x20, VmOpCode::Ret),
        ]
    }

    #[test]
    fn conditional_arms() {
        let headers = BTreeSet::from([0x00, 0x0e, 0x1a]);
        let cfg = ControlFlowGraph::build(1, 0, diamond(), &headers, &[]).unwrap();

        assert_eq!(cfg.block_count(), 3);
        assert_eq!(cfg.edge_count(), 2);

        let edges: Vec<(u64, CfgEdgeKind)> = cfg
            .outgoing_edges(cfg.entry())
            .map(|(_, _, edge)| (edge.target(), edge.kind()))
            .collect();
        assert_eq!(
            edges,
            vec![
                (0x1a, CfgEdgeKind::JumpArm { index: 0 }),
                (0x0e, CfgEdgeKind::JumpArm { index: 1 }),
            ]
        );
        assert_eq!(cfg.exits().len(), 2);
        assert_eq!(cfg.reverse_postorder()[0], cfg.entry());
    }

    #[test]
    fn input_order_does_not_matter() {
        let headers = BTreeSet::from([0x00, 0x0e, 0x1a]);
        let mut reversed = diamond();
        reversed.reverse();

        let a = ControlFlowGraph::build(1, 0, diamond(), &headers, &[]).unwrap();
        let b = ControlFlowGraph::build(1, 0, reversed, &headers, &[]).unwrap();
        assert_eq!(a.to_dot(None), b.to_dot(None));
    }

    #[test]
    fn blocks_split_after_return_and_at_gaps() {
        let instructions = vec![
            op(0x00, VmOpCode::PushiDword),
            op(0x06, VmOpCode::Ret),
            op(0x08, VmOpCode::Nop),
            op(0x0a, VmOpCode::Nop),
            op(0x10, VmOpCode::Nop),
        ];
        let cfg =
            ControlFlowGraph::build(1, 0, instructions, &BTreeSet::from([0]), &[]).unwrap();

        let starts: Vec<u64> = cfg.blocks().map(|(_, block)| block.offset).collect();
        assert_eq!(starts, vec![0x00, 0x08, 0x10]);
        assert_eq!(cfg.block_at(0x0b), cfg.node_ids().nth(1));
        assert_eq!(cfg.block_at(0x0c), None);
        assert_eq!(cfg.edge_count(), 0);
    }

    #[test]
    fn handler_edges() {
        let mut handler = op(0x10, VmOpCode::PushiDword);
        handler.state = ProgramState::new(0x10, 0);
        let instructions = vec![
            op(0x00, VmOpCode::Try),
            op(0x02, VmOpCode::Nop),
            op(0x04, VmOpCode::Ret),
            handler,
            op(0x16, VmOpCode::Ret),
        ];
        let frame = ExceptionHandlerFrame {
            try_start: 0,
            kind: EhType::Catch,
            handler: 0x10,
            filter: None,
            catch_type: Some(1),
        };

        let cfg = ControlFlowGraph::build(
            1,
            0,
            instructions,
            &BTreeSet::from([0x00, 0x10]),
            &[frame],
        )
        .unwrap();

        let handler_node = cfg.block_at(0x10).unwrap();
        let predecessors: Vec<NodeId> = cfg.predecessors(handler_node).collect();
        assert_eq!(predecessors, vec![cfg.entry()]);
        let (_, _, edge) = cfg.outgoing_edges(cfg.entry()).next().unwrap();
        assert!(edge.kind().is_exceptional());
        assert!(cfg.to_dot(Some("export 1")).contains("CATCH"));
    }

    #[test]
    fn missing_entry() {
        let result = ControlFlowGraph::build(
            1,
            0x40,
            vec![op(0x00, VmOpCode::Ret)],
            &BTreeSet::new(),
            &[],
        );
        assert!(matches!(result, Err(crate::Error::GraphError(_))));
        assert!(ControlFlowGraph::build(1, 0, Vec::new(), &BTreeSet::new(), &[]).is_err());
    }
}
