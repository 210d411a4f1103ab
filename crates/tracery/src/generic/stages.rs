bitflags::bitflags! {
    /// Pipeline stages used to express execution dependencies in barriers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 0x0000_0001;
        const DRAW_INDIRECT = 0x0000_0002;
        const VERTEX_INPUT = 0x0000_0004;
        const VERTEX_SHADER = 0x0000_0008;
        const FRAGMENT_SHADER = 0x0000_0010;
        const COLOR_OUTPUT = 0x0000_0020;
        const COMPUTE_SHADER = 0x0000_0040;
        const TRANSFER = 0x0000_0080;
        const ACCELERATION_STRUCTURE_BUILD = 0x0000_0100;
        const RAY_TRACING_SHADER = 0x0000_0200;
        const HOST = 0x0000_0400;
        const BOTTOM_OF_PIPE = 0x0000_0800;
    }
}
