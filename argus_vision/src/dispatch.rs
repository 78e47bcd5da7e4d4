//! Backend fan-out.
//!
//! Each operation here is the single backend call a component issues after
//! validation and registration: host bindings go through the vendor table
//! with raw pointers, remote bindings pack one wire block and invoke it.
//! Validation never happens here; callers arrive with checked shapes.

use bytemuck::Zeroable;

use argus_core::backend::params::{
    BoxFilterParams, BoxJob, BoxParams, DecodeJob, DecodeParams, FlowFilterParams, FlowJob,
    FlowParams, PillarJob, PillarParams, RemapJob, RemapMapParams, StereoJob, StereoParams,
};
use argus_core::backend::{wire, AcceleratorChannel, BackendBinding, KernelHandle};
use argus_core::error::ArgusResult;
use argus_core::types::BackendClass;

fn invoke<T: bytemuck::Pod>(
    class: BackendClass,
    channel: &dyn AcceleratorChannel,
    remote: u64,
    method: u32,
    args: &mut T,
) -> ArgusResult<()> {
    wire::invoke_block(channel, remote, class, method, args, &[])
}

pub(crate) fn remap_create(
    binding: &BackendBinding,
    params: &RemapMapParams,
) -> ArgusResult<KernelHandle> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.remap_create_map(params),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::RemapCreateArgs::zeroed();
            args.map_x_addr = params.map_x_addr as u64;
            args.map_y_addr = params.map_y_addr as u64;
            args.pipeline = params.pipeline;
            args.src_width = params.src_width;
            args.src_height = params.src_height;
            args.dst_width = params.dst_width;
            args.dst_height = params.dst_height;
            args.map_width = params.map_width;
            args.map_height = params.map_height;
            args.undistort = params.undistort as u32;
            args.border_const = params.border_const as u32;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_REMAP_CREATE, &mut args)?;
            Ok(KernelHandle(args.handle))
        }
    }
}

pub(crate) fn remap_run(
    binding: &BackendBinding,
    map: KernelHandle,
    job: &RemapJob,
) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.remap_run(map, job),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::RemapRunArgs::zeroed();
            args.map = map.0;
            args.src_fd = job.src.dma_handle as i32;
            args.src_offset = job.src.region_offset as u32;
            args.src_plane0_size = job.src.plane_size[0];
            args.src_plane1_size = job.src.plane_size[1];
            args.dst_fd = job.dst.dma_handle as i32;
            args.dst_offset = job.dst.region_offset as u32;
            args.dst_plane0_size = job.dst.plane_size[0];
            args.roi_x = job.roi.x;
            args.roi_y = job.roi.y;
            args.roi_width = job.roi.width;
            args.roi_height = job.roi.height;
            args.roi_scale = job.roi_scale;
            if let Some([r, g, b]) = job.normalize {
                args.normalize = 1;
                args.norm_r = r;
                args.norm_g = g;
                args.norm_b = b;
            }
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_REMAP_RUN, &mut args)
        }
    }
}

pub(crate) fn remap_destroy(binding: &BackendBinding, map: KernelHandle) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.remap_destroy_map(map),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::KernelArgs::zeroed();
            args.handle = map.0;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_REMAP_DESTROY, &mut args)
        }
    }
}

pub(crate) fn flow_create(
    binding: &BackendBinding,
    params: &FlowParams,
) -> ArgusResult<KernelHandle> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.flow_create(params),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::FlowCreateArgs::zeroed();
            args.width = params.width;
            args.height = params.height;
            args.frame_rate = params.frame_rate;
            args.quality = params.quality;
            args.direction = params.direction;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_FLOW_CREATE, &mut args)?;
            Ok(KernelHandle(args.handle))
        }
    }
}

pub(crate) fn flow_set_filter(
    binding: &BackendBinding,
    session: KernelHandle,
    filter: &FlowFilterParams,
) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.flow_set_filter(session, filter),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::FlowFilterArgs::zeroed();
            args.session = session.0;
            args.hole_fill = filter.hole_fill as u32;
            args.confidence_threshold = filter.confidence_threshold as u32;
            args.variance_threshold = filter.variance_threshold as u32;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_FLOW_FILTER, &mut args)
        }
    }
}

pub(crate) fn flow_run(
    binding: &BackendBinding,
    session: KernelHandle,
    job: &FlowJob,
) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.flow_run(session, job),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::FlowRunArgs::zeroed();
            args.session = session.0;
            args.current_fd = job.current.dma_handle as i32;
            args.current_offset = job.current.region_offset as u32;
            args.reference_fd = job.reference.dma_handle as i32;
            args.reference_offset = job.reference.region_offset as u32;
            args.motion_fd = job.motion.dma_handle as i32;
            args.motion_offset = job.motion.region_offset as u32;
            args.motion_bytes = job.motion.bytes as u32;
            args.confidence_fd = job.confidence.dma_handle as i32;
            args.confidence_offset = job.confidence.region_offset as u32;
            args.confidence_bytes = job.confidence.bytes as u32;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_FLOW_RUN, &mut args)
        }
    }
}

pub(crate) fn flow_destroy(binding: &BackendBinding, session: KernelHandle) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.flow_destroy(session),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::KernelArgs::zeroed();
            args.handle = session.0;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_FLOW_DESTROY, &mut args)
        }
    }
}

pub(crate) fn stereo_create(
    binding: &BackendBinding,
    params: &StereoParams,
) -> ArgusResult<KernelHandle> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.stereo_create(params),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::StereoCreateArgs::zeroed();
            args.width = params.width;
            args.height = params.height;
            args.frame_rate = params.frame_rate;
            args.search_right_to_left = params.search_right_to_left as u32;
            args.hole_fill = params.hole_fill as u32;
            args.occlusion_confidence = params.occlusion_confidence as u32;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_STEREO_CREATE, &mut args)?;
            Ok(KernelHandle(args.handle))
        }
    }
}

pub(crate) fn stereo_run(
    binding: &BackendBinding,
    session: KernelHandle,
    job: &StereoJob,
) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.stereo_run(session, job),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::StereoRunArgs::zeroed();
            args.session = session.0;
            args.left_fd = job.left.dma_handle as i32;
            args.left_offset = job.left.region_offset as u32;
            args.right_fd = job.right.dma_handle as i32;
            args.right_offset = job.right.region_offset as u32;
            args.disparity_fd = job.disparity.dma_handle as i32;
            args.disparity_offset = job.disparity.region_offset as u32;
            args.disparity_bytes = job.disparity.bytes as u32;
            args.confidence_fd = job.confidence.dma_handle as i32;
            args.confidence_offset = job.confidence.region_offset as u32;
            args.confidence_bytes = job.confidence.bytes as u32;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_STEREO_RUN, &mut args)
        }
    }
}

pub(crate) fn stereo_destroy(binding: &BackendBinding, session: KernelHandle) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.stereo_destroy(session),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::KernelArgs::zeroed();
            args.handle = session.0;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_STEREO_DESTROY, &mut args)
        }
    }
}

pub(crate) fn pillar_create(
    binding: &BackendBinding,
    params: &PillarParams,
) -> ArgusResult<KernelHandle> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.pillar_create(params),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::PillarCreateArgs::zeroed();
            args.pillar_size = params.pillar_size;
            args.min_range = params.min_range;
            args.max_range = params.max_range;
            args.max_points = params.max_points;
            args.point_dims = params.point_dims;
            args.max_pillars = params.max_pillars;
            args.max_points_per_pillar = params.max_points_per_pillar;
            args.feature_dims = params.feature_dims;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_PILLAR_CREATE, &mut args)?;
            Ok(KernelHandle(args.handle))
        }
    }
}

pub(crate) fn pillar_run(
    binding: &BackendBinding,
    encoder: KernelHandle,
    job: &PillarJob,
) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.pillar_run(encoder, job),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::PillarRunArgs::zeroed();
            args.encoder = encoder.0;
            args.points_fd = job.points.dma_handle as i32;
            args.points_offset = job.points.region_offset as u32;
            args.points_bytes = job.points.bytes as u32;
            args.num_points = job.num_points;
            args.pillars_fd = job.pillars.dma_handle as i32;
            args.pillars_offset = job.pillars.region_offset as u32;
            args.pillars_bytes = job.pillars.bytes as u32;
            args.features_fd = job.features.dma_handle as i32;
            args.features_offset = job.features.region_offset as u32;
            args.features_bytes = job.features.bytes as u32;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_PILLAR_RUN, &mut args)
        }
    }
}

pub(crate) fn pillar_destroy(binding: &BackendBinding, encoder: KernelHandle) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.pillar_destroy(encoder),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::KernelArgs::zeroed();
            args.handle = encoder.0;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_PILLAR_DESTROY, &mut args)
        }
    }
}

pub(crate) fn bbox_create(
    binding: &BackendBinding,
    params: &BoxParams,
) -> ArgusResult<KernelHandle> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.bbox_create(params),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::BoxCreateArgs::zeroed();
            args.pillar_size = params.pillar_size;
            args.min_range = params.min_range;
            args.max_range = params.max_range;
            args.num_classes = params.num_classes;
            args.max_points = params.max_points;
            args.point_dims = params.point_dims;
            args.max_detections = params.max_detections;
            args.head_stride = params.head_stride;
            args.score_threshold = params.score_threshold;
            args.iou_threshold = params.iou_threshold;
            args.map_points_to_boxes = params.map_points_to_boxes as u32;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_BBOX_CREATE, &mut args)?;
            Ok(KernelHandle(args.handle))
        }
    }
}

pub(crate) fn bbox_set_filter(
    binding: &BackendBinding,
    post: KernelHandle,
    filter: &BoxFilterParams,
) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.bbox_set_filter(post, filter),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::BoxFilterArgs::zeroed();
            args.post = post.0;
            args.label_mask = filter.label_mask;
            args.min_center = filter.min_center;
            args.max_center = filter.max_center;
            args.max_filtered = filter.max_filtered;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_BBOX_FILTER, &mut args)
        }
    }
}

pub(crate) fn bbox_run(
    binding: &BackendBinding,
    post: KernelHandle,
    job: &BoxJob,
) -> ArgusResult<u32> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.bbox_run(post, job),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::BoxRunArgs::zeroed();
            args.post = post.0;
            args.heatmap_fd = job.heatmap.dma_handle as i32;
            args.heatmap_offset = job.heatmap.region_offset as u32;
            args.xy_fd = job.xy.dma_handle as i32;
            args.xy_offset = job.xy.region_offset as u32;
            args.z_fd = job.z.dma_handle as i32;
            args.z_offset = job.z.region_offset as u32;
            args.size_fd = job.size.dma_handle as i32;
            args.size_offset = job.size.region_offset as u32;
            args.theta_fd = job.theta.dma_handle as i32;
            args.theta_offset = job.theta.region_offset as u32;
            args.points_fd = job.points.dma_handle as i32;
            args.points_offset = job.points.region_offset as u32;
            args.boxes_fd = job.boxes.dma_handle as i32;
            args.boxes_offset = job.boxes.region_offset as u32;
            args.labels_fd = job.labels.dma_handle as i32;
            args.labels_offset = job.labels.region_offset as u32;
            args.scores_fd = job.scores.dma_handle as i32;
            args.scores_offset = job.scores.region_offset as u32;
            args.metadata_fd = job.metadata.dma_handle as i32;
            args.metadata_offset = job.metadata.region_offset as u32;
            args.num_points = job.num_points;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_BBOX_RUN, &mut args)?;
            Ok(args.detections)
        }
    }
}

pub(crate) fn bbox_destroy(binding: &BackendBinding, post: KernelHandle) -> ArgusResult<()> {
    match binding {
        BackendBinding::Host { lib, .. } => lib.bbox_destroy(post),
        BackendBinding::Remote {
            class,
            channel,
            remote,
        } => {
            let mut args = wire::KernelArgs::zeroed();
            args.handle = post.0;
            invoke(*class, channel.as_ref(), *remote, wire::METHOD_BBOX_DESTROY, &mut args)
        }
    }
}

// Decode exists only on the host codec engine; capability checks reject
// other placements before these are reached.

pub(crate) fn decode_create(
    binding: &BackendBinding,
    params: &DecodeParams,
) -> ArgusResult<KernelHandle> {
    binding.host_lib()?.decode_create(params)
}

pub(crate) fn decode_run(
    binding: &BackendBinding,
    stream: KernelHandle,
    job: &DecodeJob,
) -> ArgusResult<()> {
    binding.host_lib()?.decode_run(stream, job)
}

pub(crate) fn decode_flush(binding: &BackendBinding, stream: KernelHandle) -> ArgusResult<()> {
    binding.host_lib()?.decode_flush(stream)
}

pub(crate) fn decode_destroy(binding: &BackendBinding, stream: KernelHandle) -> ArgusResult<()> {
    binding.host_lib()?.decode_destroy(stream)
}
