//! Compute dispatches.
use ash::vk;

use super::{CommandContext, DescriptorSets};
use crate::{Error, Result, pipeline::Pipeline, shader::ShaderParameter, utils::AsVkHandle};

impl CommandContext {
    pub fn bind_pipeline(&mut self, pipeline: &Pipeline) -> Result<()> {
        let cb = self.command_buffer()?;
        unsafe {
            self.device
                .cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipeline.vk_handle());
        }
        Ok(())
    }

    /// Binds `pipeline` and `params`, then dispatches enough workgroups to cover
    /// `thread_count` invocations.
    pub fn dispatch(
        &mut self,
        pipeline: &Pipeline,
        thread_count: [u32; 3],
        params: &ShaderParameter,
    ) -> Result<()> {
        self.bind_pipeline(pipeline)?;
        self.bind_parameters(pipeline.layout(), params)?;
        self.dispatch_groups(pipeline.workgroup_count(thread_count))
    }

    /// Like [`dispatch`](Self::dispatch) with descriptor sets that were already written.
    pub fn dispatch_with_sets(
        &mut self,
        pipeline: &Pipeline,
        thread_count: [u32; 3],
        sets: &DescriptorSets,
    ) -> Result<()> {
        if sets.layout().vk_handle() != pipeline.layout().vk_handle() {
            return Err(Error::InvalidState(
                "descriptor sets were allocated for another pipeline layout",
            ));
        }
        self.bind_pipeline(pipeline)?;
        self.bind_descriptors(sets)?;
        self.dispatch_groups(pipeline.workgroup_count(thread_count))
    }

    /// Flushes pending barriers and records `vkCmdDispatch` with a workgroup count.
    pub fn dispatch_groups(&mut self, group_count: [u32; 3]) -> Result<()> {
        self.execute_barriers()?;
        let cb = self.command_buffer()?;
        let [x, y, z] = group_count;
        unsafe { self.device.cmd_dispatch(cb, x, y, z) };
        Ok(())
    }
}
