//! SPIR-V shader modules and shader programs.
//!
//! A [`ShaderModule`] wraps one SPIR-V blob. A [`ShaderProgram`] is the set of
//! stages a pipeline is built from: either a single compute stage, or a vertex
//! stage plus any of the other graphics stages.

use std::{ffi::CString, fmt::Debug};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    Device,
    driver::{Driver, NativeInfo},
    error::{Error, ResourceKind, Result},
    store::{Managed, Resource},
    utils::AsVkHandle,
};

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Checks `code` and repacks it into words.
fn spirv_words(kind: ResourceKind, code: &[u8]) -> Result<Vec<u32>> {
    if code.is_empty() {
        return Err(Error::invalid(kind, "SPIR-V code is empty"));
    }
    if !code.len().is_multiple_of(4) {
        return Err(Error::invalid(
            kind,
            format!("SPIR-V code length {} is not a multiple of 4", code.len()),
        ));
    }
    let words: Vec<u32> = code
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        return Err(Error::invalid(
            kind,
            format!("bad SPIR-V magic number {:#010x}", words[0]),
        ));
    }
    Ok(words)
}

fn create_module(device: &Device, kind: ResourceKind, words: &[u32]) -> Result<vk::ShaderModule> {
    device
        .driver()?
        .create(NativeInfo::ShaderModule(
            &vk::ShaderModuleCreateInfo::default().code(words),
        ))
        .map_err(Error::creation(kind))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderModuleCreateInfo {
    /// SPIR-V bytes, little endian.
    pub code: Vec<u8>,
}

pub struct ShaderModule {
    handle: vk::ShaderModule,
    code_size: usize,
}

impl Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}

impl ShaderModule {
    /// Length of the SPIR-V code in bytes.
    pub fn code_size(&self) -> usize {
        self.code_size
    }
}

impl AsVkHandle for ShaderModule {
    type Handle = vk::ShaderModule;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for ShaderModule {
    type CreateInfo = ShaderModuleCreateInfo;
    const KIND: ResourceKind = ResourceKind::ShaderModule;
}

impl Managed for ShaderModule {
    fn validate(_: &Device, info: &ShaderModuleCreateInfo) -> Result<()> {
        spirv_words(ResourceKind::ShaderModule, &info.code).map(drop)
    }

    fn create(device: &Device, info: ShaderModuleCreateInfo) -> Result<Self> {
        let words = spirv_words(ResourceKind::ShaderModule, &info.code)?;
        let handle = create_module(device, ResourceKind::ShaderModule, &words)?;
        Ok(Self {
            handle,
            code_size: info.code.len(),
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

/// One stage of a [`ShaderProgram`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageInfo {
    /// Exactly one stage bit.
    pub stage: vk::ShaderStageFlags,
    pub code: Vec<u8>,
    pub entry_point: CString,
}

impl ShaderStageInfo {
    /// A stage with the `main` entry point.
    pub fn new(stage: vk::ShaderStageFlags, code: Vec<u8>) -> Self {
        Self {
            stage,
            code,
            entry_point: c"main".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderProgramCreateInfo {
    pub stages: Vec<ShaderStageInfo>,
}

/// Whether a program drives the compute or the graphics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Compute,
    Graphics,
}

const GRAPHICS_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw()
        | vk::ShaderStageFlags::TESSELLATION_CONTROL.as_raw()
        | vk::ShaderStageFlags::TESSELLATION_EVALUATION.as_raw()
        | vk::ShaderStageFlags::GEOMETRY.as_raw()
        | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

fn program_kind(stages: &[ShaderStageInfo]) -> Result<ProgramKind> {
    let invalid = |reason: String| Err(Error::invalid(ResourceKind::ShaderProgram, reason));
    let mut seen = vk::ShaderStageFlags::empty();
    for stage in stages {
        if stage.stage.as_raw().count_ones() != 1 {
            return invalid(format!("{:?} is not a single stage", stage.stage));
        }
        if seen.contains(stage.stage) {
            return invalid(format!("duplicate {:?} stage", stage.stage));
        }
        seen |= stage.stage;
    }
    if seen == vk::ShaderStageFlags::COMPUTE {
        Ok(ProgramKind::Compute)
    } else if seen.contains(vk::ShaderStageFlags::VERTEX) && GRAPHICS_STAGES.contains(seen) {
        Ok(ProgramKind::Graphics)
    } else if seen.is_empty() {
        invalid("a program needs at least one stage".into())
    } else {
        invalid(format!(
            "stages {seen:?} are neither a single compute stage nor a vertex stage plus graphics stages"
        ))
    }
}

#[derive(Debug)]
struct Stage {
    stage: vk::ShaderStageFlags,
    module: vk::ShaderModule,
    entry_point: CString,
}

/// The shader stages of one pipeline, each in its own module.
pub struct ShaderProgram {
    kind: ProgramKind,
    stages: SmallVec<[Stage; 2]>,
}

impl Debug for ShaderProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderProgram")
            .field("kind", &self.kind)
            .field("stages", &self.stages)
            .finish()
    }
}

impl ShaderProgram {
    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    /// The union of all stage bits.
    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        self.stages
            .iter()
            .fold(vk::ShaderStageFlags::empty(), |acc, s| acc | s.stage)
    }

    pub fn module(&self, stage: vk::ShaderStageFlags) -> Option<vk::ShaderModule> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.module)
    }

    /// Stage descriptions for pipeline creation, in creation order.
    pub(crate) fn stage_infos(&self) -> SmallVec<[vk::PipelineShaderStageCreateInfo<'_>; 2]> {
        self.stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.stage)
                    .module(s.module)
                    .name(&s.entry_point)
            })
            .collect()
    }
}

impl AsVkHandle for ShaderProgram {
    /// The module of the first stage.
    type Handle = vk::ShaderModule;
    fn vk_handle(&self) -> Self::Handle {
        self.stages
            .first()
            .map_or(vk::ShaderModule::null(), |s| s.module)
    }
}

impl Resource for ShaderProgram {
    type CreateInfo = ShaderProgramCreateInfo;
    const KIND: ResourceKind = ResourceKind::ShaderProgram;
}

impl Managed for ShaderProgram {
    fn validate(_: &Device, info: &ShaderProgramCreateInfo) -> Result<()> {
        program_kind(&info.stages)?;
        for stage in &info.stages {
            spirv_words(ResourceKind::ShaderProgram, &stage.code)?;
        }
        Ok(())
    }

    fn create(device: &Device, info: ShaderProgramCreateInfo) -> Result<Self> {
        let kind = program_kind(&info.stages)?;
        let mut stages: SmallVec<[Stage; 2]> = SmallVec::new();
        for stage in info.stages {
            let module = spirv_words(ResourceKind::ShaderProgram, &stage.code)
                .and_then(|words| create_module(device, ResourceKind::ShaderProgram, &words));
            match module {
                Ok(module) => stages.push(Stage {
                    stage: stage.stage,
                    module,
                    entry_point: stage.entry_point,
                }),
                Err(err) => {
                    let driver = device.driver()?;
                    for created in stages {
                        driver.destroy(created.module);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self { kind, stages })
    }

    fn destroy(self, driver: &dyn Driver) {
        for stage in self.stages {
            driver.destroy(stage.module);
        }
    }
}
