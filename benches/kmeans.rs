use criterion::{Criterion, black_box, criterion_group, criterion_main};
use colordesc::kmeans::{KMeansParams, minibatch_kmeans};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// 生成有聚类模式的测试数据：非负的 d 维向量，与颜色描述符的取值范围相近
fn generate_clustered_data(n: usize, d: usize, num_clusters: usize) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(42); // 使用固定种子确保结果可重现

    // 生成聚类中心模板
    let centers = Array2::from_shape_fn((num_clusters, d), |_| rng.random_range(0.0..255.0f32));

    // 为每个向量分配到某个聚类，并在聚类中心附近生成数据
    Array2::from_shape_fn((n, d), |(i, j)| {
        let noise = rng.random_range(-8.0..8.0f32);
        (centers[[i % num_clusters, j]] + noise).max(0.0)
    })
}

fn bench_minibatch_kmeans(c: &mut Criterion) {
    let mut group = c.benchmark_group("minibatch_kmeans");
    group.sample_size(10);

    // (样本数, 维度, 中心数)
    let test_cases = black_box(vec![(20000, 128, 256), (50000, 384, 512), (100000, 384, 1024)]);

    for (n, d, k) in test_cases {
        let data = black_box(generate_clustered_data(n, d, k / 2));
        let params = KMeansParams { k, max_iter: 10, batch_size: 1024, seed: Some(0) };

        group.bench_function(format!("minibatch_kmeans_{n}_{d}_{k}"), |b| {
            b.iter(|| minibatch_kmeans(data.view(), &params))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_minibatch_kmeans);
criterion_main!(benches);
