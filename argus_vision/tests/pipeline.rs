//! A lidar perception chain wired end to end over the loopback backend:
//! pillarize feeds box extraction on one accelerator, sharing a single
//! backend session, with an injected backend fault in the middle.

use std::sync::{Mutex, MutexGuard};

use argus_core::backend::loopback;
use argus_core::buffer::TensorProps;
use argus_core::session;
use argus_core::types::{BackendClass, TensorDtype};
use argus_core::{ArgusError, SharedBuffer};
use argus_vision::box_extract::{BoxExtractInputs, BoxExtractOutputs};
use argus_vision::{BoxExtract, BoxExtractConfig, Pillarize, PillarizeConfig};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

const MAX_POINTS: u32 = 16000;
const POINT_DIMS: u32 = 4;

fn f32_buf(addr: usize, dims: &[u32]) -> SharedBuffer {
    let props = TensorProps::new(TensorDtype::F32, dims).unwrap();
    SharedBuffer::tensor(addr, 91, props.byte_size(), props)
}

fn pillarize_config(class: BackendClass) -> PillarizeConfig {
    PillarizeConfig {
        backend: class,
        pillar_size: [0.32, 0.32, 6.0],
        min_range: [-51.2, -51.2, -3.0],
        max_range: [51.2, 51.2, 3.0],
        max_points: MAX_POINTS,
        point_dims: POINT_DIMS,
        max_pillars: 12000,
        max_points_per_pillar: 32,
        feature_dims: 10,
    }
}

fn box_config(class: BackendClass) -> BoxExtractConfig {
    BoxExtractConfig {
        backend: class,
        pillar_size: [0.32, 0.32],
        min_range: [-51.2, -51.2],
        max_range: [51.2, 51.2],
        num_classes: 3,
        max_points: MAX_POINTS,
        point_dims: POINT_DIMS,
        max_detections: 500,
        head_stride: 2,
        score_threshold: 0.3,
        iou_threshold: 0.5,
        map_points_to_boxes: true,
        filter: None,
    }
}

#[test]
fn pillarize_into_box_extract_shares_one_session() {
    let _serial = serial();
    loopback::install();
    let class = BackendClass::Npu0;

    let mut pillarize = Pillarize::new();
    let mut extract = BoxExtract::new();
    pillarize.init(pillarize_config(class)).unwrap();
    extract.init(box_config(class)).unwrap();
    assert_eq!(session::use_count(class), 2);

    pillarize.start().unwrap();
    extract.start().unwrap();

    let points = f32_buf(0xb00_0000, &[MAX_POINTS, POINT_DIMS]);
    let pillars = f32_buf(0xb10_0000, &[12000, 32, POINT_DIMS]);
    let features = f32_buf(0xb20_0000, &[12000, 10]);
    pillarize.execute(&points, 9000, &pillars, &features).unwrap();

    let heatmap = f32_buf(0xb30_0000, &[3, 160, 160]);
    let xy = f32_buf(0xb40_0000, &[2, 160, 160]);
    let z = f32_buf(0xb50_0000, &[1, 160, 160]);
    let size = f32_buf(0xb60_0000, &[3, 160, 160]);
    let theta = f32_buf(0xb70_0000, &[2, 160, 160]);
    let boxes = f32_buf(0xb80_0000, &[500, 7]);
    let labels = f32_buf(0xb90_0000, &[500]);
    let scores = f32_buf(0xba0_0000, &[500]);
    let metadata = f32_buf(0xbb0_0000, &[500, 2]);

    let detections = extract
        .execute(
            &BoxExtractInputs {
                heatmap: &heatmap,
                xy: &xy,
                z: &z,
                size: &size,
                theta: &theta,
                points: &points,
                num_points: 9000,
            },
            &BoxExtractOutputs {
                boxes: &boxes,
                labels: &labels,
                scores: &scores,
                metadata: &metadata,
            },
        )
        .unwrap();
    assert_eq!(detections, 0);

    pillarize.stop().unwrap();
    pillarize.deinit().unwrap();
    // The second holder keeps the backend alive.
    assert_eq!(session::use_count(class), 1);
    assert!(session::binding(class).is_ok());

    extract.stop().unwrap();
    extract.deinit().unwrap();
    assert_eq!(session::use_count(class), 0);
}

#[test]
fn backend_fault_surfaces_and_clears() {
    let _serial = serial();
    loopback::install();
    let class = BackendClass::Npu1;

    let mut pillarize = Pillarize::new();
    pillarize.init(pillarize_config(class)).unwrap();
    pillarize.start().unwrap();

    let points = f32_buf(0xc00_0000, &[MAX_POINTS, POINT_DIMS]);
    let pillars = f32_buf(0xc10_0000, &[12000, 32, POINT_DIMS]);
    let features = f32_buf(0xc20_0000, &[12000, 10]);

    loopback::fail_next_run(class, -17);
    let err = pillarize
        .execute(&points, 100, &pillars, &features)
        .expect_err("injected fault must surface");
    match err {
        ArgusError::Backend { backend, code, .. } => {
            assert_eq!(backend, class);
            assert_eq!(code, -17);
        }
        other => panic!("expected a backend error, got {other:?}"),
    }

    // The fault is one-shot; the next frame goes through.
    pillarize.execute(&points, 100, &pillars, &features).unwrap();

    pillarize.stop().unwrap();
    pillarize.deinit().unwrap();
}
