use std::{sync::Arc, thread, time::Duration};

use basalt::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn graphics_device(gpu: &PhysicalDevice) -> Device {
    Device::new(
        gpu,
        DeviceCreateInfo {
            queues: vec![
                QueueRequest::new(vk::QueueFlags::GRAPHICS, 0, 1),
                QueueRequest::new(vk::QueueFlags::COMPUTE, 1, 1),
            ],
            extensions: vec![ash::khr::swapchain::NAME.to_owned()],
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn committed_buffer_round_trip_leaves_nothing_behind() {
    init_tracing();
    let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
    let mut device = Device::new(
        &gpu,
        DeviceCreateInfo {
            queues: vec![QueueRequest::new(vk::QueueFlags::GRAPHICS, 0, 1)],
            ..Default::default()
        },
    )
    .unwrap();
    let buffer = device
        .create_buffer(BufferCreateInfo {
            size: 256,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            committed: true,
            ..Default::default()
        })
        .unwrap();
    assert!(device.get(buffer).unwrap().is_committed());
    device.destroy_buffer(buffer).unwrap();
    assert_eq!(
        device.destroy_buffer(buffer),
        Err(Error::NotOwned {
            kind: ResourceKind::Buffer
        })
    );
    device.teardown();
    assert_eq!(gpu.live_object_count(), Some(0));
}

#[test]
fn teardown_destroys_everything_left_alive() {
    init_tracing();
    let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
    let mut device = graphics_device(&gpu);

    let layout = device
        .create_descriptor_set_layout(DescriptorSetLayoutCreateInfo {
            bindings: vec![
                vk::DescriptorSetLayoutBinding::default()
                    .binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::ALL),
            ],
            ..Default::default()
        })
        .unwrap();
    device
        .create_pipeline_layout(PipelineLayoutCreateInfo {
            set_layouts: vec![layout],
            ..Default::default()
        })
        .unwrap();
    device
        .create_texture(ImageCreateInfo::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            64,
            64,
            vk::ImageUsageFlags::empty(),
        ))
        .unwrap();
    device.create_sampler(SamplerCreateInfo::default()).unwrap();
    device
        .create_command_pool(CommandPoolCreateInfo::new(0))
        .unwrap();
    device
        .create_swapchain(SwapchainCreateInfo::new(Surface::headless(), 0, 320, 240))
        .unwrap();
    device
        .create_semaphore(SemaphoreCreateInfo::timeline())
        .unwrap();
    device.create_fence(FenceCreateInfo { signaled: true }).unwrap();
    assert_eq!(device.object_count(), 8);

    device.teardown();
    assert!(device.is_destroyed());
    assert_eq!(gpu.live_object_count(), Some(0));
    assert_eq!(
        device.create_event(EventCreateInfo::default()),
        Err(Error::AlreadyDestroyed)
    );
    assert_eq!(device.get(layout).unwrap_err(), Error::AlreadyDestroyed);
    // A second teardown is a no-op.
    device.teardown();
}

#[test]
fn bulk_operations_are_all_or_nothing() {
    init_tracing();
    let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
    let mut device = graphics_device(&gpu);
    let info = |count| QueryPoolCreateInfo {
        count,
        ..Default::default()
    };

    assert!(device.create_many::<QueryPool>([info(4), info(0), info(8)]).is_err());
    assert_eq!(device.count::<QueryPool>(), 0);

    let pools = device
        .create_many::<QueryPool>([info(4), info(8), info(16)])
        .unwrap();
    assert_eq!(pools.len(), 3);

    let mut repeated = pools.clone();
    repeated.push(pools[0]);
    assert!(device.destroy_many(&repeated).is_err());
    assert_eq!(device.count::<QueryPool>(), 3);

    device.destroy_many(&pools).unwrap();
    assert_eq!(device.count::<QueryPool>(), 0);
}

#[test]
fn handles_do_not_cross_devices() {
    init_tracing();
    let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
    let mut first = graphics_device(&gpu);
    let mut second = graphics_device(&gpu);
    let fence = first.create_fence(FenceCreateInfo::default()).unwrap();
    assert!(!second.contains(fence));
    assert_eq!(
        second.destroy_fence(fence),
        Err(Error::NotOwned {
            kind: ResourceKind::Fence
        })
    );
    assert!(first.contains(fence));
}

#[test]
fn fence_tracks_submitted_work() {
    init_tracing();
    let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
    let mut device = graphics_device(&gpu);
    let fence = device.create_fence(FenceCreateInfo::default()).unwrap();
    let timeline = device
        .create_semaphore(SemaphoreCreateInfo::timeline())
        .unwrap();

    let fence = device.get(fence).unwrap();
    let timeline = device.get(timeline).unwrap();
    let queue = device.get_queue(vk::QueueFlags::GRAPHICS, 0, 0).unwrap();

    queue
        .submit(
            &[Submission {
                waits: &[SemaphoreWait {
                    semaphore: timeline,
                    value: 1,
                }],
                ..Default::default()
            }],
            Some(fence),
        )
        .unwrap();
    assert_eq!(fence.wait(0).unwrap(), WaitStatus::Timeout);
    assert_eq!(fence.status().unwrap(), FenceStatus::Unsignaled);

    timeline.signal(1).unwrap();
    assert!(fence.wait_and_reset(u64::MAX).unwrap().is_success());
    assert_eq!(fence.status().unwrap(), FenceStatus::Unsignaled);
}

#[test]
fn timeline_is_shared_across_threads() {
    init_tracing();
    let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
    let mut device = graphics_device(&gpu);
    let timeline = device
        .create_semaphore(SemaphoreCreateInfo::timeline())
        .unwrap();
    let device = Arc::new(device);

    let waiters: Vec<_> = (1..=3u64)
        .map(|value| {
            let device = device.clone();
            thread::spawn(move || {
                device
                    .get(timeline)
                    .unwrap()
                    .wait(value, Duration::from_secs(10).as_nanos() as u64)
                    .unwrap()
            })
        })
        .collect();

    let semaphore = device.get(timeline).unwrap();
    for value in 1..=3 {
        thread::sleep(Duration::from_millis(5));
        semaphore.signal(value).unwrap();
    }
    for waiter in waiters {
        assert!(waiter.join().unwrap().is_success());
    }
    assert_eq!(semaphore.value().unwrap(), 3);
    assert!(matches!(
        semaphore.signal(2),
        Err(Error::InvalidValue {
            current: 3,
            requested: 2
        })
    ));
}

#[test]
fn lost_device_fails_waits() {
    init_tracing();
    let gpu = PhysicalDevice::headless(HeadlessAdapter::default()).unwrap();
    let mut device = graphics_device(&gpu);
    let fence = device.create_fence(FenceCreateInfo::default()).unwrap();
    device.simulate_device_loss().unwrap();
    let fence = device.get(fence).unwrap();
    assert_eq!(fence.wait(u64::MAX), Err(Error::DeviceLost));
    assert_eq!(fence.reset(), Err(Error::DeviceLost));
}
