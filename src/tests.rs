// Squall tests
//
// Host-side coverage of the runtime's decision logic: memory type
// scoring, page bucketing, sub-allocation placement, status mapping
// and the other pure pieces the GPU paths are built on.
//
// Austin Shafer - 2024

use crate as sq;
use crate::memory::{
    bucket_for_size, memory_type_score, AllocationType, AllocationUsage, MemHeapType, MemType,
};
use crate::memory::pool::{block_reusable, place_on_node};
use ash::vk;

fn mem_type(flags: vk::MemoryPropertyFlags) -> MemType {
    MemType::new(
        0,
        &vk::MemoryType {
            property_flags: flags,
            heap_index: 0,
        },
    )
}

#[test]
fn type_scoring_prefers_pure_device_local() {
    let device_local = mem_type(vk::MemoryPropertyFlags::DEVICE_LOCAL);
    let bar = mem_type(
        vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT,
    );

    let dev = vk::PhysicalDeviceType::DISCRETE_GPU;
    let pure = memory_type_score(
        MemHeapType::DeviceLocal,
        &device_local,
        AllocationUsage::DeviceLocal,
        dev,
    );
    let mapped = memory_type_score(
        MemHeapType::DeviceLocalHostVisible,
        &bar,
        AllocationUsage::DeviceLocal,
        dev,
    );
    assert_eq!(pure, 32);
    // host access shaves points off device-local scoring
    assert_eq!(mapped, 24 - 2 - 3);
    assert!(pure > mapped);

    // host-only memory never serves DeviceLocal
    let host = mem_type(
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    );
    assert_eq!(
        memory_type_score(
            MemHeapType::HostLocal,
            &host,
            AllocationUsage::DeviceLocal,
            dev
        ),
        0
    );
}

#[test]
fn type_scoring_lazily_allocated_bonus() {
    let lazy = mem_type(
        vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
    );
    let plain = mem_type(vk::MemoryPropertyFlags::DEVICE_LOCAL);
    let dev = vk::PhysicalDeviceType::DISCRETE_GPU;

    let lazy_score = memory_type_score(
        MemHeapType::DeviceLocal,
        &lazy,
        AllocationUsage::DeviceLocalLazilyAllocated,
        dev,
    );
    let plain_score = memory_type_score(
        MemHeapType::DeviceLocal,
        &plain,
        AllocationUsage::DeviceLocalLazilyAllocated,
        dev,
    );
    assert_eq!(lazy_score, 32 + 12);
    assert_eq!(plain_score, 32);
}

#[test]
fn type_scoring_transfer_directions() {
    let coherent = mem_type(
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    );
    let cached = mem_type(
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
    );
    let dev = vk::PhysicalDeviceType::DISCRETE_GPU;

    // uploads want coherent memory, readbacks want cached
    let src_coherent = memory_type_score(
        MemHeapType::HostLocal,
        &coherent,
        AllocationUsage::HostTransitionSource,
        dev,
    );
    let src_cached = memory_type_score(
        MemHeapType::HostLocal,
        &cached,
        AllocationUsage::HostTransitionSource,
        dev,
    );
    assert_eq!(src_coherent, 35);
    assert_eq!(src_cached, 28);

    let dst_coherent = memory_type_score(
        MemHeapType::HostLocal,
        &coherent,
        AllocationUsage::HostTransitionDestination,
        dev,
    );
    let dst_cached = memory_type_score(
        MemHeapType::HostLocal,
        &cached,
        AllocationUsage::HostTransitionDestination,
        dev,
    );
    assert_eq!(dst_coherent, 29);
    assert_eq!(dst_cached, 36);
}

#[test]
fn page_bucketing() {
    // requests round up to whole pages with a two-page floor
    let (size, index) = bucket_for_size(1, 2);
    assert_eq!(size, 2 * sq::PAGE_SIZE);
    assert_eq!(index, 1);

    let (size, index) = bucket_for_size(2 * sq::PAGE_SIZE, 2);
    assert_eq!(size, 2 * sq::PAGE_SIZE);
    assert_eq!(index, 1);

    let (size, index) = bucket_for_size(2 * sq::PAGE_SIZE + 1, 2);
    assert_eq!(size, 3 * sq::PAGE_SIZE);
    assert_eq!(index, 2);

    // past the bucket range the index keeps growing, free() will
    // route such nodes to the sink
    let (_, index) = bucket_for_size(64 * sq::PAGE_SIZE, 2);
    assert!(index >= sq::MAX_BUCKET_INDEX);
}

#[test]
fn suballoc_placement_alignment() {
    // plain alignment on an untouched page
    let offset = place_on_node(100, AllocationType::Unknown, AllocationType::Linear, 64, None, 1024);
    assert_eq!(offset, 128);
    assert_eq!(offset % 64, 0);

    // non-coherent memory additionally aligns to the atom size
    let offset = place_on_node(
        100,
        AllocationType::Unknown,
        AllocationType::Linear,
        64,
        Some(256),
        1024,
    );
    assert_eq!(offset, 256);

    // crossing a linear/optimal boundary forces the granularity
    let offset = place_on_node(
        100,
        AllocationType::Linear,
        AllocationType::Optimal,
        64,
        None,
        1024,
    );
    assert_eq!(offset, 1024);

    // staying within a category does not
    let offset = place_on_node(
        100,
        AllocationType::Optimal,
        AllocationType::Optimal,
        64,
        None,
        1024,
    );
    assert_eq!(offset, 128);
}

#[test]
fn suballoc_block_reuse() {
    // a block at offset 512 serves alignments up to 512
    assert!(block_reusable(512, 256, 256, 64));
    assert!(block_reusable(512, 256, 256, 512));
    // but not 1024
    assert!(!block_reusable(512, 256, 256, 1024));
    // size must cover the request
    assert!(!block_reusable(512, 128, 256, 64));
    // offset zero is infinitely aligned
    assert!(block_reusable(0, 4096, 4096, 4096));
}

#[test]
fn status_mapping() {
    use sq::SquallError;

    assert_eq!(SquallError::from_vk(vk::Result::SUCCESS), None);
    assert_eq!(
        SquallError::from_vk(vk::Result::ERROR_OUT_OF_DATE_KHR),
        Some(SquallError::OUT_OF_DATE)
    );
    assert_eq!(
        SquallError::from_vk(vk::Result::SUBOPTIMAL_KHR),
        Some(SquallError::SUBOPTIMAL)
    );
    assert_eq!(
        SquallError::from_vk(vk::Result::ERROR_DEVICE_LOST),
        Some(SquallError::DEVICE_LOST)
    );

    assert!(SquallError::NOT_READY.is_declined());
    assert!(SquallError::TIMEOUT.is_declined());
    assert!(!SquallError::OUT_OF_DATE.is_declined());
    assert!(SquallError::DEVICE_LOST.is_fatal());
    assert!(!SquallError::SUBOPTIMAL.is_fatal());
}

#[test]
fn create_info_defaults() {
    let info = sq::CreateInfo::builder().build();
    assert_eq!(info.max_suboptimal_frames, 24);
    assert_eq!(info.scheduler_interval_us, 500);
    assert!(info.device_idx.is_none());
    assert!(!info.enable_validation);

    let info = sq::CreateInfo::builder()
        .device_idx(2)
        .enable_validation(true)
        .max_texture_set_images(64)
        .build();
    assert_eq!(info.device_idx, Some(2));
    assert!(info.enable_validation);
    assert_eq!(info.max_texture_set_images, 64);
}

#[test]
fn image_aspects_and_view_compat() {
    use crate::image::{aspect_for_format, ImageViewInfo};

    assert_eq!(
        aspect_for_format(vk::Format::R8G8B8A8_UNORM),
        vk::ImageAspectFlags::COLOR
    );
    assert_eq!(
        aspect_for_format(vk::Format::D32_SFLOAT),
        vk::ImageAspectFlags::DEPTH
    );
    assert_eq!(
        aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    );

    // cube views are carved out of 2D images, not 3D ones
    let mut info = ImageViewInfo::new_2d(vk::Format::R8G8B8A8_UNORM);
    info.view_type = vk::ImageViewType::CUBE;
    assert!(info.compatible_with(vk::ImageType::TYPE_2D));
    assert!(!info.compatible_with(vk::ImageType::TYPE_3D));

    info.view_type = vk::ImageViewType::TYPE_3D;
    assert!(info.compatible_with(vk::ImageType::TYPE_3D));
    assert!(!info.compatible_with(vk::ImageType::TYPE_2D));
}

#[test]
fn queue_operation_flags() {
    use crate::queue::QueueOperations;

    let ops = QueueOperations::from_vk(
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
    );
    assert!(ops.contains(QueueOperations::GRAPHICS));
    assert!(ops.contains(QueueOperations::COMPUTE));
    assert!(ops.contains(QueueOperations::TRANSFER));
    assert!(!ops.contains(QueueOperations::PRESENT));

    let ops = QueueOperations::from_vk(vk::QueueFlags::SPARSE_BINDING);
    assert_eq!(ops, QueueOperations::SPARSE_BINDING);
}

#[test]
fn semaphore_reuse_gating() {
    use crate::sync::semaphore_reusable;

    // signaled-but-not-waited blocks reuse, as does in-use
    assert!(semaphore_reusable(false, false, false));
    assert!(!semaphore_reusable(true, false, false));
    assert!(semaphore_reusable(true, true, false));
    assert!(!semaphore_reusable(true, true, true));
    assert!(!semaphore_reusable(false, false, true));
}

#[test]
fn attachment_use_aliasing() {
    use crate::graph::AttachmentUse;

    assert!(!AttachmentUse::INPUT.may_alias());
    assert!(!AttachmentUse::OUTPUT.may_alias());
    assert!((AttachmentUse::INPUT | AttachmentUse::OUTPUT).may_alias());
    assert!((AttachmentUse::INPUT | AttachmentUse::DEPTH_STENCIL).may_alias());
    assert!(!(AttachmentUse::OUTPUT | AttachmentUse::DEPTH_STENCIL).may_alias());
}
