use std::{fmt, process, str::FromStr, sync::Arc};

use argh::FromArgs;
use arena_alloc::{Arena, BoundaryTags, FitMode, FreeSpaceIndex, RedBlackTree, SortedList};
use logger::{LogLevel, LogSink, WriterSink};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use snafu_utils::{GenericError, Report};

/// Allocate blocks from an arena and print its block map.
#[derive(Debug, FromArgs)]
struct Args {
    /// usable arena size in bytes (default: 1000)
    #[argh(option, default = "1000")]
    size: usize,
    /// allocator kind: `boundary-tag`, `red-black-tree` or `sorted-list`
    #[argh(option, default = "Kind::BoundaryTag")]
    kind: Kind,
    /// placement strategy: `first`, `best` or `worst`
    #[argh(option, default = "FitMode::FirstFit")]
    fit: FitMode,
    /// index of an allocation to free after all allocations (repeatable)
    #[argh(option)]
    free: Vec<usize>,
    /// print allocator diagnostics to stderr
    #[argh(switch, short = 'v')]
    verbose: bool,
    /// sizes of the blocks to allocate, in bytes
    #[argh(positional)]
    sizes: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    BoundaryTag,
    RedBlackTree,
    SortedList,
}

#[derive(Debug, Snafu)]
#[snafu(display(
    "unknown allocator kind `{input}`, expected `boundary-tag`, `red-black-tree` or `sorted-list`"
))]
struct ParseKindError {
    input: String,
}

impl FromStr for Kind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boundary-tag" | "bt" => Ok(Self::BoundaryTag),
            "red-black-tree" | "rb" => Ok(Self::RedBlackTree),
            "sorted-list" | "sl" => Ok(Self::SortedList),
            _ => ParseKindSnafu { input: s }.fail(),
        }
    }
}

/// Line-oriented stderr target for [`WriterSink`].
struct Stderr;

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        eprint!("{s}");
        Ok(())
    }
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        let report = Report::new(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), GenericError> {
    let sink: Option<Arc<dyn LogSink>> = if args.verbose {
        Some(Arc::new(WriterSink::new(Stderr, LogLevel::Trace).colored(true)))
    } else {
        None
    };

    match args.kind {
        Kind::BoundaryTag => run_scenario::<BoundaryTags>(args, sink),
        Kind::RedBlackTree => run_scenario::<RedBlackTree>(args, sink),
        Kind::SortedList => run_scenario::<SortedList>(args, sink),
    }
}

fn run_scenario<I>(args: &Args, sink: Option<Arc<dyn LogSink>>) -> Result<(), GenericError>
where
    I: FreeSpaceIndex,
{
    let arena = Arena::<I>::new(args.size, None, sink, args.fit)
        .whatever_context("failed to create arena")?;

    println!(
        "{} arena, {} usable bytes, {}",
        I::NAME,
        arena.capacity().whatever_context("failed to query arena")?,
        args.fit
    );

    let mut handles = Vec::with_capacity(args.sizes.len());
    for (index, &size) in args.sizes.iter().enumerate() {
        let ptr = arena
            .allocate(size)
            .with_whatever_context(|_| format!("failed to allocate block #{index} of {size} bytes"))?;
        println!("allocated #{index}: {size} bytes at {ptr:p}");
        handles.push(ptr);
    }

    for &index in &args.free {
        let ptr = handles
            .get(index)
            .copied()
            .with_whatever_context(|| format!("no allocation #{index} to free"))?;
        unsafe { arena.deallocate(ptr) }
            .with_whatever_context(|_| format!("failed to free block #{index}"))?;
        println!("freed #{index}");
    }

    println!("{:>8} {:>8}  state", "offset", "size");
    for block in arena
        .list_blocks()
        .whatever_context("failed to list arena blocks")?
    {
        let state = if block.occupied { "occupied" } else { "free" };
        println!("{:>8} {:>8}  {state}", block.offset, block.size);
    }

    Ok(())
}
