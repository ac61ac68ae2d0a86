//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use chrono::{DateTime, Local};
pub use futures::future::FutureExt;
pub use itertools::Itertools;
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use patch_dl::{
    dataset::RecordFiles,
    model::{top_k_accuracy, PatchNet, PatchNetInit},
    processor::{
        ColorDistortInit, ImagePreprocessor, PatchCropper, PatchCropperInit, FULL_IMAGE_BBOX,
    },
    profiling::Timing,
    record::{ExampleRecord, NUM_POINTS},
};
pub use rand::{prelude::*, rngs::StdRng};
pub use serde::{Deserialize, Deserializer, Serialize, Serializer};
pub use std::{
    borrow::{Borrow, Cow},
    collections::{BTreeMap, HashMap, VecDeque},
    fmt::Debug,
    future::Future,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, OptimizerConfig as _},
    Device, IndexOp, Kind, Tensor,
};
pub use tch_tensor_like::TensorLike;
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::broadcast;
pub use tracing::{error, info, info_span, trace_span, warn, Instrument};

pub type Fallible<T> = Result<T, Error>;
